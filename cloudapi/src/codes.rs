//! Numeric error codes reported to the remote service. The values are part
//! of the wire protocol and must not be renumbered.

/// Response body was not valid JSON.
pub const INVALID_JSON: u32 = 2;
/// Server rejected the login credentials.
pub const LOGIN_REJECTED: u32 = 3;
/// Attempt to pack an unknown message kind.
pub const UNKNOWN_TARGET: u32 = 4;
/// Connecting to the remote service failed.
pub const CONNECT_FAILED: u32 = 5;
/// Sending a request failed.
pub const REQUEST_FAILED: u32 = 6;
/// Reading a response failed.
pub const READ_FAILED: u32 = 7;
/// Server answered with a non-200 status.
pub const BAD_STATUS: u32 = 8;
/// Command name not in the command table.
pub const UNKNOWN_COMMAND: u32 = 40;
/// Command number missing or not an integer.
pub const BAD_COMMAND_NUMBER: u32 = 41;
/// Command number violates the acknowledgment ordering.
pub const COMMAND_OUT_OF_ORDER: u32 = 42;
/// Download could not be fetched after all retries.
pub const DOWNLOAD_FAILED: u32 = 65;
/// Download host answered with an unusable status.
pub const DOWNLOAD_BAD_STATUS: u32 = 66;
/// Downloaded payload could not be written or unpacked.
pub const DOWNLOAD_STORE_FAILED: u32 = 67;
/// Download received more bytes than announced.
pub const DOWNLOAD_CORRUPTED: u32 = 68;
/// Device driver is not operational.
pub const NOT_OPERATIONAL: u32 = 77;
/// Device driver stayed non-operational past its timeout.
pub const OPERATIONAL_TIMEOUT: u32 = 78;
/// Device was disabled by the operator.
pub const DISABLED: u32 = 98;
/// Device is no longer detected.
pub const NOT_DETECTED: u32 = 99;
/// A download is already running for this device.
pub const DOWNLOAD_IN_PROGRESS: u32 = 108;
/// Command raised while executing.
pub const COMMAND_FAILED: u32 = 109;
/// Command rejected because the device is in local mode.
pub const LOCAL_MODE: u32 = 111;
/// Device driver could not be instantiated.
pub const DRIVER_CONNECT_FAILED: u32 = 119;
/// Device driver does not support cancelling.
pub const CANCEL_UNSUPPORTED: u32 = 605;
