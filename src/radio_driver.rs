//! Contract between the mesh engine and the LoRa radio driver.

/// Errors reported by a radio driver.
///
/// Drivers map their hardware-specific failures onto these; the engine only
/// distinguishes "never came up" from "this frame did not leave the air".
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RadioError {
    /// The radio could not be initialized.
    InitializationFailed,
    /// Frame transmission failed or the transmitter is unavailable.
    TransmissionFailed,
}

#[cfg(feature = "std")]
impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioError::InitializationFailed => write!(f, "radio initialization failed"),
            RadioError::TransmissionFailed => write!(f, "frame transmission failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RadioError {}

/// Byte-oriented interface to a half-duplex LoRa transceiver.
///
/// Transmission is atomic: the engine brackets the bytes of one frame
/// between `begin_packet` and `end_packet`, and the driver blocks inside
/// `end_packet` until the frame has left the air. Reception is polled:
/// `parse_packet` returns the byte length of a pending frame (0 when idle),
/// which is then drained with `available`/`read`.
///
/// Note: pin mapping, SPI wiring and similar hardware setup are not part of
/// this trait as they are highly implementation-dependent; drivers are
/// expected to be configured before `begin` is called.
pub trait RadioDriver {
    /// Brings the radio up on the given carrier frequency in Hz.
    fn begin(&mut self, frequency: u32) -> Result<(), RadioError>;

    /// Opens a transmit buffer for one frame.
    fn begin_packet(&mut self) -> Result<(), RadioError>;

    /// Appends one byte to the open transmit buffer.
    fn write(&mut self, byte: u8);

    /// Transmits the buffered frame, blocking until it is on the air.
    fn end_packet(&mut self) -> Result<(), RadioError>;

    /// Polls for a received frame; returns its length in bytes, or 0 when
    /// no frame is pending. Any unread remainder of a previous frame is
    /// discarded.
    fn parse_packet(&mut self) -> usize;

    /// True while unread bytes of the current frame remain.
    fn available(&self) -> bool;

    /// Reads the next byte of the current frame.
    fn read(&mut self) -> Option<u8>;
}
