//! PKCS#11 C ABI front end for CardSlot.
//!
//! Every `C_*` entry point validates its pointers, delegates to the shared
//! [`Context`] and translates the outcome into a `CKR_*` code. The Rust
//! functions underneath each entry point are public so hosts embedding the
//! module can drive it without going through raw pointers.

#![allow(non_snake_case)]

use std::{ptr, slice, sync::Arc};

use cardslot_core::{
    AttributeId, AttributeLookup, AttributeSet, AttributeTemplate, ConfigError, Context,
    CredentialFailure, ErrorKind, Medium, ModuleConfig, P11Error, Resource, SessionMode,
    SlotEvent, SoftMedium, UserType,
};
use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_BBOOL, CK_C_INITIALIZE_ARGS, CK_FLAGS, CK_INFO, CK_INFO_PTR,
    CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_NOTIFY, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR,
    CK_RV, CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SESSION_INFO, CK_SESSION_INFO_PTR,
    CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO, CK_SLOT_INFO_PTR, CK_TOKEN_INFO,
    CK_TOKEN_INFO_PTR, CK_ULONG, CK_ULONG_PTR, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VOID_PTR,
    CKF_DONT_BLOCK, CKF_OS_LOCKING_OK, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKR_ACTION_PROHIBITED,
    CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_READ_ONLY, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CANT_LOCK,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR,
    CKR_DEVICE_MEMORY, CKR_DEVICE_REMOVED, CKR_FUNCTION_FAILED, CKR_FUNCTION_NOT_SUPPORTED,
    CKR_HOST_MEMORY, CKR_NO_EVENT, CKR_OBJECT_HANDLE_INVALID, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT, CKR_PIN_LEN_RANGE,
    CKR_PIN_LOCKED, CKR_SESSION_COUNT, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SESSION_READ_ONLY, CKR_SESSION_READ_ONLY_EXISTS,
    CKR_SESSION_READ_WRITE_SO_EXISTS, CKR_SLOT_ID_INVALID, CKR_TEMPLATE_INCOMPLETE,
    CKR_TOKEN_NOT_PRESENT, CKR_TOKEN_NOT_RECOGNIZED, CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN, CKR_USER_TYPE_INVALID, CKU_SO,
    CKU_USER,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

pub mod attribute;
pub mod info;

/// Environment variable holding the `tracing` filter for the module.
pub const LOG_ENV: &str = "CARDSLOT_LOG";

#[derive(Default)]
struct GlobalState {
    context: Option<Arc<Context>>,
}

static STATE: Lazy<RwLock<GlobalState>> = Lazy::new(|| RwLock::new(GlobalState::default()));

/// Errors raised by the PKCS#11 front end prior to translation into
/// CKR_* return codes.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("cryptoki already initialized")]
    AlreadyInitialized,
    #[error("cryptoki not initialized")]
    NotInitialized,
    #[error("invalid arguments")]
    ArgumentsBad,
    #[error("application-supplied locking is not supported")]
    CantLock,
    #[error("output buffer too small")]
    BufferTooSmall,
    #[error("user type {0} is not supported")]
    UserTypeInvalid(CK_USER_TYPE),
    #[error("value of attribute {0:#x} is malformed")]
    AttributeValueInvalid(AttributeId),
    #[error("parallel sessions are not supported")]
    ParallelNotSupported,
    #[error("function not supported")]
    FunctionNotSupported,
    #[error("no slot event pending")]
    NoEvent,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] P11Error),
}

fn translate_core(err: &P11Error) -> CK_RV {
    match err {
        P11Error::SlotIdInvalid(_) => CKR_SLOT_ID_INVALID,
        P11Error::SessionHandleInvalid(_) => CKR_SESSION_HANDLE_INVALID,
        P11Error::ObjectHandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
        P11Error::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
        P11Error::AlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
        P11Error::AnotherUserLoggedIn => CKR_USER_ANOTHER_ALREADY_LOGGED_IN,
        P11Error::NotLoggedIn => CKR_USER_NOT_LOGGED_IN,
        P11Error::SessionReadOnly => CKR_SESSION_READ_ONLY,
        P11Error::SessionReadOnlyExists => CKR_SESSION_READ_ONLY_EXISTS,
        P11Error::SessionReadWriteSoExists => CKR_SESSION_READ_WRITE_SO_EXISTS,
        P11Error::TokenAlreadyAttached(_) => CKR_FUNCTION_FAILED,
        P11Error::OperationActive => CKR_OPERATION_ACTIVE,
        P11Error::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
        P11Error::AttributeReadOnly(_) => CKR_ATTRIBUTE_READ_ONLY,
        P11Error::ActionProhibited => CKR_ACTION_PROHIBITED,
        P11Error::TemplateIncomplete(_) => CKR_TEMPLATE_INCOMPLETE,
        P11Error::PinLenRange => CKR_PIN_LEN_RANGE,
        P11Error::TokenNotPresent(_) => CKR_TOKEN_NOT_PRESENT,
        P11Error::TokenNotRecognized(_) => CKR_TOKEN_NOT_RECOGNIZED,
        P11Error::DeviceRemoved(_) => CKR_DEVICE_REMOVED,
        P11Error::Credential(CredentialFailure::Incorrect { .. }) => CKR_PIN_INCORRECT,
        P11Error::Credential(CredentialFailure::Locked) => CKR_PIN_LOCKED,
        P11Error::Capacity(Resource::Sessions | Resource::SessionHandles) => CKR_SESSION_COUNT,
        P11Error::Capacity(Resource::SlotIds | Resource::Slots) => CKR_HOST_MEMORY,
        P11Error::Capacity(Resource::ObjectNumbers) => CKR_DEVICE_MEMORY,
        P11Error::TokenInit(_) | P11Error::Medium(_) => CKR_DEVICE_ERROR,
    }
}

pub fn translate_error(err: &FrontendError) -> CK_RV {
    match err {
        FrontendError::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
        FrontendError::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
        FrontendError::ArgumentsBad => CKR_ARGUMENTS_BAD,
        FrontendError::CantLock => CKR_CANT_LOCK,
        FrontendError::BufferTooSmall => CKR_BUFFER_TOO_SMALL,
        FrontendError::UserTypeInvalid(_) => CKR_USER_TYPE_INVALID,
        FrontendError::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
        FrontendError::ParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
        FrontendError::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
        FrontendError::NoEvent => CKR_NO_EVENT,
        FrontendError::Config(_) => CKR_FUNCTION_FAILED,
        FrontendError::Core(err) => translate_core(err),
    }
}

/// Log a failed entry point and produce its return code.
fn fail(function: &'static str, err: FrontendError) -> CK_RV {
    match &err {
        FrontendError::Config(_) => error!(function, error = %err, "pkcs11 configuration error"),
        FrontendError::Core(core) if core.kind() == ErrorKind::Medium => {
            error!(function, error = %err, "pkcs11 medium failure")
        }
        _ => debug!(function, error = %err, "pkcs11 call rejected"),
    }
    translate_error(&err)
}

fn run(function: &'static str, call: impl FnOnce() -> Result<(), FrontendError>) -> CK_RV {
    match call() {
        Ok(()) => CKR_OK,
        Err(err) => fail(function, err),
    }
}

fn context() -> Result<Arc<Context>, FrontendError> {
    STATE
        .read()
        .context
        .clone()
        .ok_or(FrontendError::NotInitialized)
}

/// Install a `tracing` subscriber when `CARDSLOT_LOG` is set. A host that
/// already installed its own subscriber keeps it.
fn init_logging() {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Read a caller buffer of `len` bytes.
///
/// # Safety
/// `data` must be null with `len == 0` or point to `len` readable bytes.
unsafe fn input<'a>(data: *const u8, len: CK_ULONG) -> Result<&'a [u8], FrontendError> {
    if len == 0 {
        return Ok(&[]);
    }
    if data.is_null() {
        return Err(FrontendError::ArgumentsBad);
    }
    Ok(unsafe { slice::from_raw_parts(data, len as usize) })
}

/// Standard two-call list protocol: a null `out` reports the length, a
/// short buffer reports the length and fails.
///
/// # Safety
/// `count` must be writable; `out`, when not null, must hold `*count` items.
unsafe fn write_list<T: Copy>(
    items: &[T],
    out: *mut T,
    count: CK_ULONG_PTR,
) -> Result<(), FrontendError> {
    if count.is_null() {
        return Err(FrontendError::ArgumentsBad);
    }
    let required = items.len() as CK_ULONG;
    unsafe {
        if out.is_null() {
            *count = required;
            return Ok(());
        }
        if *count < required {
            *count = required;
            return Err(FrontendError::BufferTooSmall);
        }
        ptr::copy_nonoverlapping(items.as_ptr(), out, items.len());
        *count = required;
    }
    Ok(())
}

/// # Safety
/// `out` must be null or writable.
unsafe fn write_out<T>(out: *mut T, value: T) -> Result<(), FrontendError> {
    if out.is_null() {
        return Err(FrontendError::ArgumentsBad);
    }
    unsafe { out.write(value) };
    Ok(())
}

/// Reject reserved pointers and application-supplied mutexes we cannot use.
///
/// # Safety
/// `args` must be null or point to a `CK_C_INITIALIZE_ARGS`.
unsafe fn check_init_args(args: *const CK_C_INITIALIZE_ARGS) -> Result<(), FrontendError> {
    let Some(args) = (unsafe { args.as_ref() }) else {
        return Ok(());
    };
    if !args.pReserved.is_null() {
        return Err(FrontendError::ArgumentsBad);
    }
    let supplied = [
        args.CreateMutex.is_some(),
        args.DestroyMutex.is_some(),
        args.LockMutex.is_some(),
        args.UnlockMutex.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();
    match supplied {
        0 => Ok(()),
        4 if args.flags & CKF_OS_LOCKING_OK != 0 => Ok(()),
        4 => Err(FrontendError::CantLock),
        _ => Err(FrontendError::ArgumentsBad),
    }
}

/// Initialize the module over an explicit configuration and medium.
pub fn initialize_with(config: ModuleConfig, medium: Arc<dyn Medium>) -> Result<(), FrontendError> {
    let mut guard = STATE.write();
    if guard.context.is_some() {
        return Err(FrontendError::AlreadyInitialized);
    }
    let context = Context::initialize(config, medium)?;
    guard.context = Some(Arc::new(context));
    info!("pkcs11 front end initialized");
    Ok(())
}

/// Initialize from `CARDSLOT_CONFIG` (or defaults) over a [`SoftMedium`].
pub fn initialize() -> Result<(), FrontendError> {
    init_logging();
    if STATE.read().context.is_some() {
        return Err(FrontendError::AlreadyInitialized);
    }
    let config = ModuleConfig::from_env()?;
    let medium = Arc::new(SoftMedium::from_config(&config));
    initialize_with(config, medium)
}

pub fn finalize() -> Result<(), FrontendError> {
    let context = STATE
        .write()
        .context
        .take()
        .ok_or(FrontendError::NotInitialized)?;
    context.finalize();
    info!("pkcs11 front end finalized");
    Ok(())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(pInitArgs: CK_VOID_PTR) -> CK_RV {
    run("C_Initialize", || {
        unsafe { check_init_args(pInitArgs as *const CK_C_INITIALIZE_ARGS) }?;
        initialize()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(pReserved: CK_VOID_PTR) -> CK_RV {
    if !pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    run("C_Finalize", finalize)
}

pub fn get_info() -> Result<CK_INFO, FrontendError> {
    Ok(info::library_info(context()?.info()))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(pInfo: CK_INFO_PTR) -> CK_RV {
    run("C_GetInfo", || unsafe { write_out(pInfo, get_info()?) })
}

pub fn get_slot_list(token_present: bool) -> Result<Vec<CK_SLOT_ID>, FrontendError> {
    let slots = context()?.slot_list(token_present)?;
    Ok(slots.into_iter().map(|slot| slot as CK_SLOT_ID).collect())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    run("C_GetSlotList", || {
        let slots = get_slot_list(tokenPresent != 0)?;
        unsafe { write_list(&slots, pSlotList, pulCount) }
    })
}

pub fn get_slot_info(slot_id: CK_SLOT_ID) -> Result<CK_SLOT_INFO, FrontendError> {
    Ok(info::slot_info(&context()?.slot_info(slot_id as _)?))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) -> CK_RV {
    run("C_GetSlotInfo", || unsafe {
        write_out(pInfo, get_slot_info(slotID)?)
    })
}

pub fn get_token_info(slot_id: CK_SLOT_ID) -> Result<CK_TOKEN_INFO, FrontendError> {
    let context = context()?;
    let token = context.token_info(slot_id as _)?;
    Ok(info::token_info(&token, context.config().max_sessions))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) -> CK_RV {
    run("C_GetTokenInfo", || unsafe {
        write_out(pInfo, get_token_info(slotID)?)
    })
}

pub fn get_mechanism_list(slot_id: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>, FrontendError> {
    let mechanisms = context()?.mechanisms(slot_id as _)?;
    Ok(mechanisms
        .into_iter()
        .map(|mechanism| mechanism as CK_MECHANISM_TYPE)
        .collect())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismList(
    slotID: CK_SLOT_ID,
    pMechanismList: CK_MECHANISM_TYPE_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    run("C_GetMechanismList", || {
        let mechanisms = get_mechanism_list(slotID)?;
        unsafe { write_list(&mechanisms, pMechanismList, pulCount) }
    })
}

/// Report the oldest pending insertion or removal. Only the non-blocking
/// form is supported.
pub fn wait_for_slot_event(flags: CK_FLAGS) -> Result<CK_SLOT_ID, FrontendError> {
    if flags & CKF_DONT_BLOCK == 0 {
        return Err(FrontendError::FunctionNotSupported);
    }
    match context()?.poll_slot_event()? {
        Some(event) => {
            let slot = event.slot_id();
            match event {
                SlotEvent::Inserted(_) => debug!(slot, "reporting token insertion"),
                SlotEvent::Removed(_) => debug!(slot, "reporting token removal"),
            }
            Ok(slot as CK_SLOT_ID)
        }
        None => Err(FrontendError::NoEvent),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_WaitForSlotEvent(
    flags: CK_FLAGS,
    pSlot: CK_SLOT_ID_PTR,
    pReserved: CK_VOID_PTR,
) -> CK_RV {
    if pSlot.is_null() || !pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match wait_for_slot_event(flags) {
        Ok(slot) => {
            unsafe { *pSlot = slot };
            CKR_OK
        }
        // An empty queue is the normal answer to a poll.
        Err(FrontendError::NoEvent) => CKR_NO_EVENT,
        Err(err) => fail("C_WaitForSlotEvent", err),
    }
}

pub fn open_session(slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> Result<CK_SESSION_HANDLE, FrontendError> {
    if flags & CKF_SERIAL_SESSION == 0 {
        return Err(FrontendError::ParallelNotSupported);
    }
    let mode = if flags & CKF_RW_SESSION != 0 {
        SessionMode::ReadWrite
    } else {
        SessionMode::ReadOnly
    };
    let handle = context()?.open_session(slot_id as _, mode)?;
    Ok(handle as CK_SESSION_HANDLE)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if phSession.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    run("C_OpenSession", || unsafe {
        write_out(phSession, open_session(slotID, flags)?)
    })
}

pub fn close_session(session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
    Ok(context()?.close_session(session as _)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    run("C_CloseSession", || close_session(hSession))
}

pub fn close_all_sessions(slot_id: CK_SLOT_ID) -> Result<(), FrontendError> {
    let closed = context()?.close_all_sessions(slot_id as _)?;
    debug!(slot = slot_id, closed, "closed all sessions");
    Ok(())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseAllSessions(slotID: CK_SLOT_ID) -> CK_RV {
    run("C_CloseAllSessions", || close_all_sessions(slotID))
}

pub fn get_session_info(session: CK_SESSION_HANDLE) -> Result<CK_SESSION_INFO, FrontendError> {
    Ok(info::session_info(&context()?.session_info(session as _)?))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) -> CK_RV {
    run("C_GetSessionInfo", || unsafe {
        write_out(pInfo, get_session_info(hSession)?)
    })
}

fn user_type(raw: CK_USER_TYPE) -> Result<UserType, FrontendError> {
    match raw {
        CKU_SO => Ok(UserType::SecurityOfficer),
        CKU_USER => Ok(UserType::User),
        other => Err(FrontendError::UserTypeInvalid(other)),
    }
}

pub fn login(session: CK_SESSION_HANDLE, user: CK_USER_TYPE, pin: &[u8]) -> Result<(), FrontendError> {
    let role = user_type(user)?;
    Ok(context()?.login(session as _, role, pin)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Login(
    hSession: CK_SESSION_HANDLE,
    userType: CK_USER_TYPE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    run("C_Login", || {
        let pin = unsafe { input(pPin, ulPinLen) }?;
        login(hSession, userType, pin)
    })
}

pub fn logout(session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
    Ok(context()?.logout(session as _)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Logout(hSession: CK_SESSION_HANDLE) -> CK_RV {
    run("C_Logout", || logout(hSession))
}

pub fn init_pin(session: CK_SESSION_HANDLE, pin: &[u8]) -> Result<(), FrontendError> {
    Ok(context()?.init_pin(session as _, pin)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_InitPIN(
    hSession: CK_SESSION_HANDLE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    run("C_InitPIN", || {
        let pin = unsafe { input(pPin, ulPinLen) }?;
        init_pin(hSession, pin)
    })
}

pub fn set_pin(session: CK_SESSION_HANDLE, old: &[u8], new: &[u8]) -> Result<(), FrontendError> {
    Ok(context()?.set_pin(session as _, old, new)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetPIN(
    hSession: CK_SESSION_HANDLE,
    pOldPin: CK_UTF8CHAR_PTR,
    ulOldLen: CK_ULONG,
    pNewPin: CK_UTF8CHAR_PTR,
    ulNewLen: CK_ULONG,
) -> CK_RV {
    run("C_SetPIN", || {
        let old = unsafe { input(pOldPin, ulOldLen) }?;
        let new = unsafe { input(pNewPin, ulNewLen) }?;
        set_pin(hSession, old, new)
    })
}

pub fn create_object(
    session: CK_SESSION_HANDLE,
    attributes: AttributeSet,
) -> Result<CK_OBJECT_HANDLE, FrontendError> {
    let handle = context()?.create_object(session as _, attributes)?;
    Ok(handle as CK_OBJECT_HANDLE)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CreateObject(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phObject.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    run("C_CreateObject", || {
        let raw = unsafe { attribute::attributes(pTemplate, ulCount) }?;
        let attributes = unsafe { attribute::attribute_set_from(raw) }?;
        unsafe { write_out(phObject, create_object(hSession, attributes)?) }
    })
}

pub fn destroy_object(session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> Result<(), FrontendError> {
    Ok(context()?.destroy_object(session as _, object as _)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE) -> CK_RV {
    run("C_DestroyObject", || destroy_object(hSession, hObject))
}

pub fn get_attribute_value(
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    ids: &[AttributeId],
) -> Result<Vec<AttributeLookup>, FrontendError> {
    Ok(context()?.get_attributes(session as _, object as _, ids)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    let raw = match unsafe { attribute::attributes(pTemplate, ulCount) } {
        Ok(raw) => raw,
        Err(err) => return fail("C_GetAttributeValue", err),
    };
    let ids: Vec<AttributeId> = raw.iter().map(|entry| entry.type_ as AttributeId).collect();
    match get_attribute_value(hSession, hObject, &ids) {
        Ok(lookups) => unsafe { attribute::write_lookups(raw, &lookups) },
        Err(err) => fail("C_GetAttributeValue", err),
    }
}

pub fn set_attribute_value(
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    template: &AttributeTemplate,
) -> Result<(), FrontendError> {
    Ok(context()?.set_attributes(session as _, object as _, template)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    run("C_SetAttributeValue", || {
        let raw = unsafe { attribute::attributes(pTemplate, ulCount) }?;
        let template = unsafe { attribute::template_from(raw) }?;
        set_attribute_value(hSession, hObject, &template)
    })
}

pub fn find_objects_init(
    session: CK_SESSION_HANDLE,
    template: &AttributeTemplate,
) -> Result<(), FrontendError> {
    Ok(context()?.find_init(session as _, template)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsInit(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    run("C_FindObjectsInit", || {
        let raw = unsafe { attribute::attributes(pTemplate, ulCount) }?;
        let template = unsafe { attribute::template_from(raw) }?;
        find_objects_init(hSession, &template)
    })
}

pub fn find_objects(
    session: CK_SESSION_HANDLE,
    max: usize,
) -> Result<Vec<CK_OBJECT_HANDLE>, FrontendError> {
    let handles = context()?.find_next(session as _, max)?;
    Ok(handles
        .into_iter()
        .map(|handle| handle as CK_OBJECT_HANDLE)
        .collect())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjects(
    hSession: CK_SESSION_HANDLE,
    phObject: CK_OBJECT_HANDLE_PTR,
    ulMaxObjectCount: CK_ULONG,
    pulObjectCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulObjectCount.is_null() || (phObject.is_null() && ulMaxObjectCount > 0) {
        return CKR_ARGUMENTS_BAD;
    }
    run("C_FindObjects", || {
        let handles = find_objects(hSession, ulMaxObjectCount as usize)?;
        unsafe {
            // phObject may be null when no room was offered.
            if !handles.is_empty() {
                ptr::copy_nonoverlapping(handles.as_ptr(), phObject, handles.len());
            }
            *pulObjectCount = handles.len() as CK_ULONG;
        }
        Ok(())
    })
}

pub fn find_objects_final(session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
    Ok(context()?.find_final(session as _)?)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) -> CK_RV {
    run("C_FindObjectsFinal", || find_objects_final(hSession))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardslot_core::MediumError;
    use parking_lot::Mutex;

    static SERIAL: Mutex<()> = Mutex::new(());

    fn start() {
        let config = ModuleConfig::default();
        let medium = Arc::new(SoftMedium::from_config(&config));
        initialize_with(config, medium).unwrap();
    }

    #[test]
    fn initialize_and_finalize_roundtrip() {
        let _serial = SERIAL.lock();
        assert_eq!(C_GetInfo(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
        start();
        let info = get_info().unwrap();
        assert_eq!(info.cryptokiVersion.major, 2);
        assert_eq!(&info.manufacturerID[..8], b"CardSlot");
        assert_eq!(C_Finalize(ptr::null_mut()), CKR_OK);
        assert_eq!(C_Finalize(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
    }

    #[test]
    fn double_initialize_is_rejected() {
        let _serial = SERIAL.lock();
        start();
        let config = ModuleConfig::default();
        let medium = Arc::new(SoftMedium::from_config(&config));
        assert!(matches!(
            initialize_with(config, medium),
            Err(FrontendError::AlreadyInitialized)
        ));
        finalize().unwrap();
    }

    #[test]
    fn reserved_pointers_are_rejected() {
        let _serial = SERIAL.lock();
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: 0,
            pReserved: ptr::null_mut(),
        };
        let mut reserved = 0u8;
        args.pReserved = &mut reserved as *mut u8 as CK_VOID_PTR;
        assert_eq!(
            C_Initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR),
            CKR_ARGUMENTS_BAD
        );
        let mut reserved = 0u8;
        assert_eq!(
            C_Finalize(&mut reserved as *mut u8 as CK_VOID_PTR),
            CKR_ARGUMENTS_BAD
        );
    }

    #[test]
    fn core_errors_map_to_return_codes() {
        let cases = [
            (P11Error::SlotIdInvalid(9), CKR_SLOT_ID_INVALID),
            (P11Error::DeviceRemoved(0), CKR_DEVICE_REMOVED),
            (P11Error::Credential(CredentialFailure::Locked), CKR_PIN_LOCKED),
            (
                P11Error::Credential(CredentialFailure::Incorrect { remaining: 2 }),
                CKR_PIN_INCORRECT,
            ),
            (P11Error::Capacity(Resource::Sessions), CKR_SESSION_COUNT),
            (P11Error::SessionReadWriteSoExists, CKR_SESSION_READ_WRITE_SO_EXISTS),
            (
                P11Error::Medium(MediumError::Unreadable("crc".into())),
                CKR_DEVICE_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(translate_error(&FrontendError::Core(err)), expected);
        }
        assert_eq!(
            translate_error(&FrontendError::UserTypeInvalid(7)),
            CKR_USER_TYPE_INVALID
        );
    }

    #[test]
    fn user_types_are_checked() {
        assert_eq!(user_type(CKU_SO).unwrap(), UserType::SecurityOfficer);
        assert_eq!(user_type(CKU_USER).unwrap(), UserType::User);
        assert!(matches!(user_type(2), Err(FrontendError::UserTypeInvalid(2))));
    }
}
