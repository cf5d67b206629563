//! Sense-data decoding and completion classification.
//!
//! Maps the `{scsi status, host status, driver status, sense buffer}` tuple
//! returned with each command completion onto a [`Category`]. Only the sense
//! key is needed for the copy engine's retry taxonomy; full sense decoding is
//! deliberately out of scope.

use crate::error::Category;

// SCSI status byte values.
pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_CONDITION_MET: u8 = 0x04;
pub const STATUS_BUSY: u8 = 0x08;
pub const STATUS_RESERVATION_CONFLICT: u8 = 0x18;
pub const STATUS_TASK_SET_FULL: u8 = 0x28;

// Sense keys.
pub const SK_NO_SENSE: u8 = 0x0;
pub const SK_RECOVERED_ERROR: u8 = 0x1;
pub const SK_NOT_READY: u8 = 0x2;
pub const SK_MEDIUM_ERROR: u8 = 0x3;
pub const SK_HARDWARE_ERROR: u8 = 0x4;
pub const SK_ILLEGAL_REQUEST: u8 = 0x5;
pub const SK_UNIT_ATTENTION: u8 = 0x6;
pub const SK_ABORTED_COMMAND: u8 = 0xb;

// Host (transport) status of interest; anything non-zero is a failure.
pub const DID_OK: u16 = 0x00;

/// DRIVER_SENSE bit: the driver captured valid sense data.
pub const DRIVER_SENSE: u16 = 0x08;

/// Additional sense code for INVALID COMMAND OPERATION CODE.
const ASC_INVALID_OPCODE: u8 = 0x20;

/// Extract the sense key from fixed (0x70/0x71) or descriptor (0x72/0x73)
/// format sense data. Returns `None` when the buffer is too short or the
/// response code is unrecognised.
pub fn sense_key(sense: &[u8]) -> Option<u8> {
    if sense.is_empty() {
        return None;
    }
    match sense[0] & 0x7f {
        0x70 | 0x71 => sense.get(2).map(|b| b & 0xf),
        0x72 | 0x73 => sense.get(1).map(|b| b & 0xf),
        _ => None,
    }
}

/// Extract the additional sense code, if present.
pub fn additional_sense_code(sense: &[u8]) -> Option<u8> {
    match sense.first()? & 0x7f {
        0x70 | 0x71 => sense.get(12).copied(),
        0x72 | 0x73 => sense.get(2).copied(),
        _ => None,
    }
}

/// Classify a completion. `sense` should be the valid prefix of the sense
/// buffer (may be empty).
pub fn categorize(status: u8, host_status: u16, driver_status: u16, sense: &[u8]) -> Category {
    // Transport and driver problems trump the SCSI status.
    if host_status != DID_OK {
        return Category::Other;
    }
    if driver_status & !DRIVER_SENSE != 0 {
        return Category::Other;
    }
    match status & 0x7e {
        STATUS_GOOD | STATUS_CONDITION_MET => {
            if driver_status & DRIVER_SENSE != 0 {
                categorize_sense(sense, Category::Clean)
            } else {
                Category::Clean
            }
        }
        STATUS_CHECK_CONDITION => categorize_sense(sense, Category::Other),
        STATUS_BUSY | STATUS_TASK_SET_FULL | STATUS_RESERVATION_CONFLICT => Category::Other,
        _ => Category::Other,
    }
}

fn categorize_sense(sense: &[u8], no_key: Category) -> Category {
    match sense_key(sense) {
        None => no_key,
        Some(SK_NO_SENSE) => Category::Clean,
        Some(SK_RECOVERED_ERROR) => Category::Recovered,
        Some(SK_NOT_READY) => Category::NotReady,
        Some(SK_MEDIUM_ERROR) | Some(SK_HARDWARE_ERROR) => Category::MediumHard,
        Some(SK_ILLEGAL_REQUEST) => {
            if additional_sense_code(sense) == Some(ASC_INVALID_OPCODE) {
                Category::InvalidOp
            } else {
                Category::IllegalRequest
            }
        }
        Some(SK_UNIT_ATTENTION) => Category::UnitAttention,
        Some(SK_ABORTED_COMMAND) => Category::AbortedCommand,
        Some(_) => Category::Other,
    }
}

/// Build a fixed-format sense buffer; test helper for the classification
/// paths and the mock transport.
#[cfg(test)]
pub fn fixed_sense(key: u8, asc: u8, ascq: u8) -> [u8; 18] {
    let mut sb = [0u8; 18];
    sb[0] = 0x70;
    sb[2] = key & 0xf;
    sb[7] = 10; /* additional length */
    sb[12] = asc;
    sb[13] = ascq;
    sb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_good_status_clean() {
        assert_eq!(categorize(STATUS_GOOD, 0, 0, &[]), Category::Clean);
    }

    #[test]
    fn test_fixed_sense_key_extraction() {
        let sb = fixed_sense(SK_UNIT_ATTENTION, 0x28, 0);
        assert_eq!(sense_key(&sb), Some(SK_UNIT_ATTENTION));
        assert_eq!(additional_sense_code(&sb), Some(0x28));
    }

    #[test]
    fn test_descriptor_sense_key_extraction() {
        let sb = [0x72u8, SK_MEDIUM_ERROR, 0x11, 0x00];
        assert_eq!(sense_key(&sb), Some(SK_MEDIUM_ERROR));
        assert_eq!(additional_sense_code(&sb), Some(0x11));
    }

    #[test]
    fn test_deferred_formats_recognised() {
        let sb = [0x71u8, 0, SK_NOT_READY, 0];
        assert_eq!(sense_key(&sb), Some(SK_NOT_READY));
    }

    #[test]
    fn test_unknown_response_code() {
        assert_eq!(sense_key(&[0x40, 1, 2, 3]), None);
        assert_eq!(sense_key(&[]), None);
    }

    #[test]
    fn test_check_condition_categories() {
        let cases = [
            (SK_RECOVERED_ERROR, Category::Recovered),
            (SK_NOT_READY, Category::NotReady),
            (SK_MEDIUM_ERROR, Category::MediumHard),
            (SK_HARDWARE_ERROR, Category::MediumHard),
            (SK_UNIT_ATTENTION, Category::UnitAttention),
            (SK_ABORTED_COMMAND, Category::AbortedCommand),
        ];
        for (key, want) in cases {
            let sb = fixed_sense(key, 0, 0);
            assert_eq!(
                categorize(STATUS_CHECK_CONDITION, 0, 0, &sb),
                want,
                "sense key 0x{key:x}"
            );
        }
    }

    #[test]
    fn test_illegal_request_split() {
        let sb = fixed_sense(SK_ILLEGAL_REQUEST, ASC_INVALID_OPCODE, 0);
        assert_eq!(
            categorize(STATUS_CHECK_CONDITION, 0, 0, &sb),
            Category::InvalidOp
        );
        let sb = fixed_sense(SK_ILLEGAL_REQUEST, 0x24, 0);
        assert_eq!(
            categorize(STATUS_CHECK_CONDITION, 0, 0, &sb),
            Category::IllegalRequest
        );
    }

    #[test]
    fn test_transport_failure_wins() {
        let sb = fixed_sense(SK_RECOVERED_ERROR, 0, 0);
        assert_eq!(categorize(STATUS_GOOD, 0x07, 0, &sb), Category::Other);
    }

    #[test]
    fn test_driver_error_without_sense_bit() {
        assert_eq!(categorize(STATUS_GOOD, 0, 0x04, &[]), Category::Other);
    }

    #[test]
    fn test_good_with_driver_sense_recovered() {
        let sb = fixed_sense(SK_RECOVERED_ERROR, 0x17, 0);
        assert_eq!(
            categorize(STATUS_GOOD, 0, DRIVER_SENSE, &sb),
            Category::Recovered
        );
    }

    #[test]
    fn test_busy_is_other() {
        assert_eq!(categorize(STATUS_BUSY, 0, 0, &[]), Category::Other);
    }

    #[test]
    fn test_check_condition_without_sense_is_other() {
        assert_eq!(categorize(STATUS_CHECK_CONDITION, 0, 0, &[]), Category::Other);
    }
}
