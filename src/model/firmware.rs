//! Firmware catalogue
//!
//! Maps a charge point model to the firmware version it should run and
//! where to fetch it. Consulted by the `UpdateFirmware` admin call.

#[derive(Debug, Clone)]
pub struct FirmwareRecord {
    pub firmware_id: String,
    pub charge_point_model: String,
    pub firmware_version: String,
    /// Download URL handed to the charger in `UpdateFirmware`.
    pub location: String,
}
