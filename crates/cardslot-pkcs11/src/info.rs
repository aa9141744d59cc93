//! Builders for the fixed-layout info structures.

use cardslot_core::{
    CredentialStatus, LibraryInfo, SessionInfo, SessionMode, SessionState, SlotInfo, TokenInfo,
    token::RetryCounter,
};
use cryptoki_sys::{
    CK_FLAGS, CK_INFO, CK_SESSION_INFO, CK_SLOT_INFO, CK_STATE, CK_TOKEN_INFO, CK_ULONG,
    CK_VERSION, CKF_HW_SLOT, CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE, CKF_RW_SESSION,
    CKF_SERIAL_SESSION, CKF_SO_PIN_COUNT_LOW, CKF_SO_PIN_FINAL_TRY, CKF_SO_PIN_LOCKED,
    CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_COUNT_LOW, CKF_USER_PIN_FINAL_TRY,
    CKF_USER_PIN_INITIALIZED, CKF_USER_PIN_LOCKED, CKS_RO_PUBLIC_SESSION,
    CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION, CKS_RW_SO_FUNCTIONS, CKS_RW_USER_FUNCTIONS,
};

const CRYPTOKI_VERSION: CK_VERSION = CK_VERSION { major: 2, minor: 40 };
const HARDWARE_VERSION: CK_VERSION = CK_VERSION { major: 1, minor: 0 };
const UNAVAILABLE: CK_ULONG = CK_ULONG::MAX;

/// Copy `text` into a blank-padded fixed field, truncating on overflow.
pub fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

pub fn library_info(info: &LibraryInfo) -> CK_INFO {
    CK_INFO {
        cryptokiVersion: CRYPTOKI_VERSION,
        manufacturerID: padded(&info.manufacturer),
        flags: 0,
        libraryDescription: padded(&info.description),
        libraryVersion: CK_VERSION {
            major: info.version.0,
            minor: info.version.1,
        },
    }
}

pub fn slot_info(info: &SlotInfo) -> CK_SLOT_INFO {
    let mut flags: CK_FLAGS = 0;
    if info.token_present {
        flags |= CKF_TOKEN_PRESENT;
    }
    if info.removable {
        flags |= CKF_REMOVABLE_DEVICE;
    }
    if info.hardware {
        flags |= CKF_HW_SLOT;
    }
    CK_SLOT_INFO {
        slotDescription: padded(&info.description),
        manufacturerID: padded(&info.manufacturer),
        flags,
        hardwareVersion: HARDWARE_VERSION,
        firmwareVersion: HARDWARE_VERSION,
    }
}

fn pin_flags(
    counter: &RetryCounter,
    count_low: CK_FLAGS,
    final_try: CK_FLAGS,
    locked: CK_FLAGS,
) -> CK_FLAGS {
    match counter.status() {
        CredentialStatus::Locked | CredentialStatus::Disabled => locked,
        CredentialStatus::Usable { remaining } if remaining == counter.limit() => 0,
        CredentialStatus::Usable { remaining: 1 } => count_low | final_try,
        CredentialStatus::Usable { .. } => count_low,
    }
}

pub fn token_flags(info: &TokenInfo) -> CK_FLAGS {
    let mut flags = CKF_TOKEN_INITIALIZED | CKF_USER_PIN_INITIALIZED | CKF_LOGIN_REQUIRED;
    flags |= pin_flags(
        &info.user_pin,
        CKF_USER_PIN_COUNT_LOW,
        CKF_USER_PIN_FINAL_TRY,
        CKF_USER_PIN_LOCKED,
    );
    flags |= pin_flags(
        &info.so_pin,
        CKF_SO_PIN_COUNT_LOW,
        CKF_SO_PIN_FINAL_TRY,
        CKF_SO_PIN_LOCKED,
    );
    flags
}

pub fn token_info(info: &TokenInfo, max_sessions: usize) -> CK_TOKEN_INFO {
    CK_TOKEN_INFO {
        label: padded(&info.label),
        manufacturerID: padded(&info.manufacturer),
        model: padded(&info.model),
        serialNumber: padded(&info.serial),
        flags: token_flags(info),
        ulMaxSessionCount: max_sessions as CK_ULONG,
        ulSessionCount: info.session_count as CK_ULONG,
        ulMaxRwSessionCount: max_sessions as CK_ULONG,
        ulRwSessionCount: info.rw_session_count as CK_ULONG,
        ulMaxPinLen: info.max_pin_len as CK_ULONG,
        ulMinPinLen: info.min_pin_len as CK_ULONG,
        ulTotalPublicMemory: UNAVAILABLE,
        ulFreePublicMemory: UNAVAILABLE,
        ulTotalPrivateMemory: UNAVAILABLE,
        ulFreePrivateMemory: UNAVAILABLE,
        hardwareVersion: HARDWARE_VERSION,
        firmwareVersion: HARDWARE_VERSION,
        utcTime: [b' '; 16],
    }
}

pub fn session_state(state: SessionState) -> CK_STATE {
    match state {
        SessionState::RoPublic => CKS_RO_PUBLIC_SESSION,
        SessionState::RoUser => CKS_RO_USER_FUNCTIONS,
        SessionState::RwPublic => CKS_RW_PUBLIC_SESSION,
        SessionState::RwUser => CKS_RW_USER_FUNCTIONS,
        SessionState::RwSecurityOfficer => CKS_RW_SO_FUNCTIONS,
    }
}

pub fn session_info(info: &SessionInfo) -> CK_SESSION_INFO {
    let mut flags = CKF_SERIAL_SESSION;
    if info.mode == SessionMode::ReadWrite {
        flags |= CKF_RW_SESSION;
    }
    CK_SESSION_INFO {
        slotID: info.slot_id as _,
        state: session_state(info.state),
        flags,
        ulDeviceError: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardslot_core::{LoginState, UserType};

    fn info_with(user: RetryCounter, so: RetryCounter) -> TokenInfo {
        TokenInfo {
            label: "team".to_string(),
            manufacturer: "CardSlot".to_string(),
            model: "PKCS#15".to_string(),
            serial: "0001".to_string(),
            login: LoginState::Public,
            session_count: 0,
            rw_session_count: 0,
            min_pin_len: 4,
            max_pin_len: 16,
            user_pin: user,
            so_pin: so,
        }
    }

    #[test]
    fn pads_and_truncates() {
        assert_eq!(&padded::<8>("abc"), b"abc     ");
        assert_eq!(&padded::<4>("abcdef"), b"abcd");
    }

    #[test]
    fn fresh_token_reports_no_pin_warnings() {
        let info = info_with(
            RetryCounter::new(UserType::User, 3),
            RetryCounter::new(UserType::SecurityOfficer, 15),
        );
        let flags = token_flags(&info);
        assert_ne!(flags & CKF_LOGIN_REQUIRED, 0);
        assert_eq!(flags & (CKF_USER_PIN_COUNT_LOW | CKF_USER_PIN_LOCKED), 0);
        assert_eq!(flags & CKF_SO_PIN_LOCKED, 0);

        let raw = token_info(&info, 32);
        assert_eq!(&raw.label[..4], b"team");
        assert_eq!(raw.label[4], b' ');
        assert_eq!(raw.ulMaxSessionCount, 32);
        assert_eq!(raw.ulMinPinLen, 4);
    }

    #[test]
    fn exhausted_counters_report_locked() {
        let user = RetryCounter::new(UserType::User, 0);
        let so = RetryCounter::new(UserType::SecurityOfficer, 0);
        let flags = token_flags(&info_with(user, so));
        assert_ne!(flags & CKF_USER_PIN_LOCKED, 0);
        assert_ne!(flags & CKF_SO_PIN_LOCKED, 0);
    }

    #[test]
    fn session_flags_follow_mode() {
        let raw = session_info(&SessionInfo {
            slot_id: 2,
            mode: SessionMode::ReadWrite,
            state: SessionState::RwUser,
        });
        assert_eq!(raw.slotID, 2);
        assert_eq!(raw.state, CKS_RW_USER_FUNCTIONS);
        assert_eq!(raw.flags, CKF_SERIAL_SESSION | CKF_RW_SESSION);
    }
}
