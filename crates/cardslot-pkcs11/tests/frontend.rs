//! Drives the C entry points the way a PKCS#11 application would.

use std::{mem::MaybeUninit, ptr, sync::Arc};

use cardslot_core::{
    AttributeSet, AttributeValue, ModuleConfig, SoftCard, SoftMedium,
    attributes::{class, ids},
    medium::private_data_object,
};
use cardslot_pkcs11::*;
use cryptoki_sys::{
    CK_ATTRIBUTE, CK_FALSE, CK_FLAGS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE,
    CK_SESSION_INFO, CK_SLOT_ID, CK_TOKEN_INFO, CK_TRUE, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_VOID_PTR, CKF_DONT_BLOCK,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKF_USER_PIN_COUNT_LOW, CKF_USER_PIN_FINAL_TRY,
    CKF_USER_PIN_LOCKED, CKR_ACTION_PROHIBITED, CKR_ATTRIBUTE_READ_ONLY, CKR_ATTRIBUTE_SENSITIVE,
    CKR_BUFFER_TOO_SMALL, CKR_FUNCTION_NOT_SUPPORTED, CKR_NO_EVENT, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_PIN_INCORRECT, CKR_PIN_LOCKED, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SESSION_READ_ONLY, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_NOT_LOGGED_IN, CKR_USER_TYPE_INVALID, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS,
    CKU_USER,
};
use parking_lot::{Mutex, MutexGuard};

const READER: &str = "Reader A";
const USER_PIN: &[u8] = b"1234";

static SERIAL: Mutex<()> = Mutex::new(());

/// Holds the module initialized for one test and finalizes it on drop.
struct Module {
    medium: Arc<SoftMedium>,
    _serial: MutexGuard<'static, ()>,
}

impl Drop for Module {
    fn drop(&mut self) {
        let _ = finalize();
    }
}

fn sealed_secret() -> AttributeSet {
    AttributeSet::new()
        .with(ids::CLASS, AttributeValue::Uint(class::SECRET_KEY))
        .with(ids::TOKEN, AttributeValue::Bool(true))
        .with(ids::PRIVATE, AttributeValue::Bool(false))
        .with(ids::SENSITIVE, AttributeValue::Bool(true))
        .with(ids::LABEL, AttributeValue::Bytes(b"sealed".to_vec()))
        .with(ids::VALUE, AttributeValue::Bytes(vec![0x42; 16]))
}

fn card() -> SoftCard {
    SoftCard::new("front", USER_PIN, b"87654321")
        .with_object(
            AttributeSet::new()
                .with(ids::CLASS, AttributeValue::Uint(class::DATA))
                .with(ids::TOKEN, AttributeValue::Bool(true))
                .with(ids::LABEL, AttributeValue::Bytes(b"readme".to_vec())),
        )
        .with_object(private_data_object("notes", b"secret notes"))
        .with_object(sealed_secret())
}

fn module() -> Module {
    let serial = SERIAL.lock();
    let medium = Arc::new(SoftMedium::new());
    medium.add_reader(READER);
    medium.insert_card(READER, card()).unwrap();
    let config = ModuleConfig {
        readers: Vec::new(),
        ..ModuleConfig::default()
    };
    initialize_with(config, medium.clone()).unwrap();
    Module {
        medium,
        _serial: serial,
    }
}

fn open(flags: CK_FLAGS) -> CK_SESSION_HANDLE {
    let mut session: CK_SESSION_HANDLE = 0;
    assert_eq!(
        C_OpenSession(0, flags, ptr::null_mut(), None, &mut session),
        CKR_OK
    );
    session
}

fn user_login(session: CK_SESSION_HANDLE, pin: &[u8]) -> CK_RV {
    C_Login(session, CKU_USER, pin.as_ptr() as *mut u8, pin.len() as CK_ULONG)
}

fn label_template(label: &mut [u8]) -> CK_ATTRIBUTE {
    CK_ATTRIBUTE {
        type_: ids::LABEL as _,
        pValue: label.as_mut_ptr() as CK_VOID_PTR,
        ulValueLen: label.len() as CK_ULONG,
    }
}

fn find_all(session: CK_SESSION_HANDLE, template: &mut [CK_ATTRIBUTE]) -> Vec<CK_OBJECT_HANDLE> {
    assert_eq!(
        C_FindObjectsInit(session, template.as_mut_ptr(), template.len() as CK_ULONG),
        CKR_OK
    );
    let mut found = Vec::new();
    loop {
        let mut batch = [0 as CK_OBJECT_HANDLE; 2];
        let mut count: CK_ULONG = 0;
        assert_eq!(
            C_FindObjects(session, batch.as_mut_ptr(), batch.len() as CK_ULONG, &mut count),
            CKR_OK
        );
        if count == 0 {
            break;
        }
        found.extend_from_slice(&batch[..count as usize]);
    }
    assert_eq!(C_FindObjectsFinal(session), CKR_OK);
    found
}

fn token_info() -> CK_TOKEN_INFO {
    let mut info = MaybeUninit::<CK_TOKEN_INFO>::uninit();
    assert_eq!(C_GetTokenInfo(0, info.as_mut_ptr()), CKR_OK);
    unsafe { info.assume_init() }
}

#[test]
fn slot_list_follows_two_call_protocol() {
    let _module = module();
    let mut count: CK_ULONG = 0;
    assert_eq!(C_GetSlotList(CK_TRUE, ptr::null_mut(), &mut count), CKR_OK);
    assert_eq!(count, 1);

    let mut slots = [CK_SLOT_ID::MAX; 2];
    let mut short: CK_ULONG = 0;
    assert_eq!(
        C_GetSlotList(CK_TRUE, slots.as_mut_ptr(), &mut short),
        CKR_BUFFER_TOO_SMALL
    );
    assert_eq!(short, 1);

    count = slots.len() as CK_ULONG;
    assert_eq!(C_GetSlotList(CK_FALSE, slots.as_mut_ptr(), &mut count), CKR_OK);
    assert_eq!(count, 1);
    assert_eq!(slots[0], 0);
}

#[test]
fn token_info_is_padded_and_tracks_pin_failures() {
    let _module = module();
    let info = token_info();
    assert_eq!(&info.label[..5], b"front");
    assert!(info.label[5..].iter().all(|byte| *byte == b' '));
    assert_eq!(info.ulSessionCount, 0);

    let session = open(CKF_SERIAL_SESSION);
    assert_eq!(user_login(session, b"0000"), CKR_PIN_INCORRECT);
    let flags = token_info().flags;
    assert_ne!(flags & CKF_USER_PIN_COUNT_LOW, 0);
    assert_eq!(flags & CKF_USER_PIN_FINAL_TRY, 0);

    assert_eq!(user_login(session, b"0000"), CKR_PIN_INCORRECT);
    assert_ne!(token_info().flags & CKF_USER_PIN_FINAL_TRY, 0);

    assert_eq!(user_login(session, b"0000"), CKR_PIN_LOCKED);
    assert_ne!(token_info().flags & CKF_USER_PIN_LOCKED, 0);
    assert_eq!(user_login(session, USER_PIN), CKR_PIN_LOCKED);
}

#[test]
fn login_reveals_private_objects() {
    let _module = module();
    let first = open(CKF_SERIAL_SESSION);
    let second = open(CKF_SERIAL_SESSION);
    assert_eq!(find_all(first, &mut []).len(), 2);

    assert_eq!(user_login(first, USER_PIN), CKR_OK);
    // The login is shared by every session on the token.
    assert_eq!(find_all(second, &mut []).len(), 3);
    let mut info = MaybeUninit::<CK_SESSION_INFO>::uninit();
    assert_eq!(C_GetSessionInfo(second, info.as_mut_ptr()), CKR_OK);
    assert_eq!(unsafe { info.assume_init() }.state, CKS_RO_USER_FUNCTIONS);

    let mut notes = *b"notes";
    let found = find_all(second, &mut [label_template(&mut notes)]);
    assert_eq!(found, vec![2]);

    assert_eq!(C_Logout(first), CKR_OK);
    assert_eq!(find_all(second, &mut []).len(), 2);
    let mut info = MaybeUninit::<CK_SESSION_INFO>::uninit();
    assert_eq!(C_GetSessionInfo(second, info.as_mut_ptr()), CKR_OK);
    assert_eq!(unsafe { info.assume_init() }.state, CKS_RO_PUBLIC_SESSION);
}

#[test]
fn second_search_while_active_is_rejected() {
    let _module = module();
    let session = open(CKF_SERIAL_SESSION);
    assert_eq!(C_FindObjectsInit(session, ptr::null_mut(), 0), CKR_OK);
    assert_eq!(C_FindObjectsInit(session, ptr::null_mut(), 0), CKR_OPERATION_ACTIVE);
    assert_eq!(C_FindObjectsFinal(session), CKR_OK);
}

#[test]
fn zero_capacity_search_returns_nothing_and_keeps_cursor() {
    let _module = module();
    let session = open(CKF_SERIAL_SESSION);
    assert_eq!(C_FindObjectsInit(session, ptr::null_mut(), 0), CKR_OK);

    let mut count: CK_ULONG = CK_ULONG::MAX;
    assert_eq!(
        C_FindObjects(session, ptr::null_mut(), 0, &mut count),
        CKR_OK
    );
    assert_eq!(count, 0);

    let mut batch = [0 as CK_OBJECT_HANDLE; 8];
    assert_eq!(
        C_FindObjects(session, batch.as_mut_ptr(), batch.len() as CK_ULONG, &mut count),
        CKR_OK
    );
    // readme and the sealed secret are public.
    assert_eq!(count, 2);
    assert_eq!(C_FindObjectsFinal(session), CKR_OK);
}

#[test]
fn attribute_values_report_lengths_and_sensitivity() {
    let _module = module();
    let session = open(CKF_SERIAL_SESSION);

    let mut query = [CK_ATTRIBUTE {
        type_: ids::LABEL as _,
        pValue: ptr::null_mut(),
        ulValueLen: 0,
    }];
    assert_eq!(C_GetAttributeValue(session, 1, query.as_mut_ptr(), 1), CKR_OK);
    assert_eq!(query[0].ulValueLen, 6);

    let mut label = [0u8; 6];
    let mut fetch = [label_template(&mut label)];
    assert_eq!(C_GetAttributeValue(session, 1, fetch.as_mut_ptr(), 1), CKR_OK);
    assert_eq!(&label, b"readme");

    let mut value = [0u8; 16];
    let mut secret = [CK_ATTRIBUTE {
        type_: ids::VALUE as _,
        pValue: value.as_mut_ptr() as CK_VOID_PTR,
        ulValueLen: value.len() as CK_ULONG,
    }];
    assert_eq!(
        C_GetAttributeValue(session, 3, secret.as_mut_ptr(), 1),
        CKR_ATTRIBUTE_SENSITIVE
    );
    assert_eq!(secret[0].ulValueLen, CK_UNAVAILABLE_INFORMATION);
    assert_eq!(value, [0u8; 16]);
}

#[test]
fn object_lifecycle_through_templates() {
    let _module = module();
    let readonly = open(CKF_SERIAL_SESSION);
    let session = open(CKF_SERIAL_SESSION | CKF_RW_SESSION);

    let mut class_value = (class::DATA as CK_ULONG).to_ne_bytes();
    let mut label = *b"draft";
    let mut template = [
        CK_ATTRIBUTE {
            type_: ids::CLASS as _,
            pValue: class_value.as_mut_ptr() as CK_VOID_PTR,
            ulValueLen: class_value.len() as CK_ULONG,
        },
        label_template(&mut label),
    ];
    let mut object: CK_OBJECT_HANDLE = 0;
    assert_eq!(
        C_CreateObject(session, template.as_mut_ptr(), 2, &mut object),
        CKR_USER_NOT_LOGGED_IN
    );
    assert_eq!(user_login(session, USER_PIN), CKR_OK);
    assert_eq!(
        C_CreateObject(readonly, template.as_mut_ptr(), 2, &mut object),
        CKR_SESSION_READ_ONLY
    );
    assert_eq!(
        C_CreateObject(session, template.as_mut_ptr(), 2, &mut object),
        CKR_OK
    );
    assert_eq!(object, 4);

    let mut renamed = *b"final";
    let mut update = [label_template(&mut renamed)];
    assert_eq!(C_SetAttributeValue(session, object, update.as_mut_ptr(), 1), CKR_OK);
    let mut read_back = [0u8; 5];
    let mut fetch = [label_template(&mut read_back)];
    assert_eq!(C_GetAttributeValue(session, object, fetch.as_mut_ptr(), 1), CKR_OK);
    assert_eq!(&read_back, b"final");

    let mut other_class = (class::CERTIFICATE as CK_ULONG).to_ne_bytes();
    let mut reclass = [CK_ATTRIBUTE {
        type_: ids::CLASS as _,
        pValue: other_class.as_mut_ptr() as CK_VOID_PTR,
        ulValueLen: other_class.len() as CK_ULONG,
    }];
    assert_eq!(
        C_SetAttributeValue(session, object, reclass.as_mut_ptr(), 1),
        CKR_ATTRIBUTE_READ_ONLY
    );

    let mut no = CK_FALSE;
    let mut pin_down = [CK_ATTRIBUTE {
        type_: ids::DESTROYABLE as _,
        pValue: &mut no as *mut u8 as CK_VOID_PTR,
        ulValueLen: 1,
    }];
    let mut fixed: CK_OBJECT_HANDLE = 0;
    let mut fixed_template = [template[0], template[1], pin_down[0]];
    assert_eq!(
        C_CreateObject(session, fixed_template.as_mut_ptr(), 3, &mut fixed),
        CKR_OK
    );
    assert_eq!(fixed, 5);
    assert_eq!(C_DestroyObject(session, fixed), CKR_ACTION_PROHIBITED);
    assert_eq!(C_DestroyObject(session, object), CKR_OK);
    assert!(!find_all(session, &mut pin_down).contains(&object));
}

#[test]
fn removal_is_reported_and_invalidates_sessions() {
    let module = module();
    let session = open(CKF_SERIAL_SESSION);
    let mut slot: CK_SLOT_ID = CK_SLOT_ID::MAX;

    assert_eq!(
        C_WaitForSlotEvent(0, &mut slot, ptr::null_mut()),
        CKR_FUNCTION_NOT_SUPPORTED
    );
    assert_eq!(
        C_WaitForSlotEvent(CKF_DONT_BLOCK, &mut slot, ptr::null_mut()),
        CKR_NO_EVENT
    );

    module.medium.remove_card(READER).unwrap();
    assert_eq!(
        C_WaitForSlotEvent(CKF_DONT_BLOCK, &mut slot, ptr::null_mut()),
        CKR_OK
    );
    assert_eq!(slot, 0);
    assert_eq!(C_CloseSession(session), CKR_SESSION_HANDLE_INVALID);
    let mut info = MaybeUninit::<CK_TOKEN_INFO>::uninit();
    assert_eq!(C_GetTokenInfo(0, info.as_mut_ptr()), CKR_TOKEN_NOT_PRESENT);

    module.medium.insert_card(READER, card()).unwrap();
    slot = CK_SLOT_ID::MAX;
    assert_eq!(
        C_WaitForSlotEvent(CKF_DONT_BLOCK, &mut slot, ptr::null_mut()),
        CKR_OK
    );
    assert_eq!(slot, 0);
    // Handles keep counting after a reattach.
    assert!(open(CKF_SERIAL_SESSION) > session);
}

#[test]
fn session_flags_and_user_types_are_validated() {
    let _module = module();
    let mut session: CK_SESSION_HANDLE = 0;
    assert_eq!(
        C_OpenSession(0, 0, ptr::null_mut(), None, &mut session),
        CKR_SESSION_PARALLEL_NOT_SUPPORTED
    );
    let session = open(CKF_SERIAL_SESSION);
    let pin = USER_PIN;
    assert_eq!(
        C_Login(session, 7, pin.as_ptr() as *mut u8, pin.len() as CK_ULONG),
        CKR_USER_TYPE_INVALID
    );
    assert_eq!(C_CloseAllSessions(0), CKR_OK);
    assert_eq!(C_CloseSession(session), CKR_SESSION_HANDLE_INVALID);
}
