//! Error types shared by the framework and every handler plugin.
//!
//! Two layers exist:
//!
//! - [`FuncError`] is the result taxonomy of a plugin call. The framework
//!   interprets each variant to decide whether to retry, wait, escalate to the
//!   operator, or give up. Several variants (`LotStart`, `LotDone`,
//!   `DeviceStart`, `Jam`) are not failures in the usual sense but handler
//!   state notifications that interrupt the current call.
//! - [`TransportError`] describes what went wrong on the wire. Plugins map it
//!   into a `FuncError` with [`TransportError::to_func_error`], which depends on
//!   the interface the handler is attached to.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for plugin call results.
pub type FuncResult<T = ()> = std::result::Result<T, FuncError>;

/// Outcome of a handler plugin call that did not complete normally.
///
/// # Framework handling
///
/// | variant | framework reaction |
/// |---|---|
/// | `Waiting`, `Timeout` | keep polling, apply the waiting policy |
/// | `Gpib`, `Rs232`, `Lan` | raise an interface problem event |
/// | `Answer` | raise an answer error event |
/// | `Jam`, `LotStart`, `LotDone`, `DeviceStart` | return the code to the test cell client |
/// | `Binning`, `Config` | log, complete the call |
/// | `Aborted` | set the abort flag, complete the call |
/// | anything else | complete the call with an error |
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncError {
    /// The plugin was called before it was initialised.
    #[error("plugin not initialized")]
    NotInit,

    /// The plugin handle does not belong to a live plugin.
    #[error("invalid plugin handle")]
    InvalidHandle,

    /// The operation is not available for this handler.
    #[error("operation not available for this handler")]
    NotAvailable,

    /// Resource exhaustion inside the plugin.
    #[error("out of memory")]
    Memory,

    /// The driver configuration is missing a value or holds an invalid one.
    ///
    /// **Recovery Strategy**: fix the configuration file and restart the driver.
    #[error("configuration error")]
    Config,

    /// The handler did not answer within the heartbeat timeout.
    #[error("handler timed out")]
    Timeout,

    /// Bin data could not be built or was not acknowledged correctly.
    ///
    /// A binning error may affect device test quality; the framework treats it
    /// as a severe condition.
    #[error("binning error")]
    Binning,

    /// GPIB interface failure.
    #[error("GPIB communication error")]
    Gpib,

    /// LAN interface failure.
    #[error("LAN communication error")]
    Lan,

    /// RS-232 interface failure.
    #[error("RS-232 communication error")]
    Rs232,

    /// The configured handler model is not supported by this plugin.
    #[error("unsupported handler model")]
    Model,

    /// The call has not completed yet and should be repeated.
    ///
    /// This is the normal result of a poll cycle where the handler has no
    /// devices ready. Repeating the call resumes the pending exchange.
    #[error("operation still in progress")]
    Waiting,

    /// The call was interrupted by an abort request.
    #[error("operation aborted")]
    Aborted,

    /// The handler sent a reply the plugin could not interpret.
    #[error("unexpected answer from handler")]
    Answer,

    /// The handler or plugin is in a state that cannot be recovered.
    #[error("fatal handler error")]
    Fatal,

    /// The handler reported a jam.
    #[error("handler jam")]
    Jam,

    /// The handler signalled the start of a lot.
    #[error("handler reported lot start")]
    LotStart,

    /// The handler signalled the end of a lot.
    #[error("handler reported lot done")]
    LotDone,

    /// The handler signalled the start of a device cycle.
    #[error("handler reported device start")]
    DeviceStart,

    /// First retest of the current lot is requested.
    #[error("first retest requested")]
    FirstRetest,

    /// Second retest of the current lot is requested.
    #[error("second retest requested")]
    SecondRetest,

    /// All retests are done.
    #[error("retest done")]
    RetestDone,

    /// The handler has a deal with the tester (site handshake accepted).
    #[error("handler deal accepted")]
    HaveDeal,
}

impl FuncError {
    /// Whether the framework should simply repeat the call.
    pub fn is_pending(&self) -> bool {
        matches!(self, FuncError::Waiting | FuncError::Timeout)
    }

    /// Whether this variant reports a handler event rather than a failure.
    pub fn is_handler_event(&self) -> bool {
        matches!(
            self,
            FuncError::LotStart | FuncError::LotDone | FuncError::DeviceStart | FuncError::Jam
        )
    }
}

/// Physical or logical interface a handler is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// IEEE-488 bus (reached through a TCP gateway).
    Gpib,
    /// Serial line.
    Rs232,
    /// TCP client connection.
    Lan,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InterfaceKind::Gpib => "gpib",
            InterfaceKind::Rs232 => "rs232",
            InterfaceKind::Lan => "lan",
        };
        write!(f, "{}", label)
    }
}

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// Sending a message did not complete in time.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// No message arrived in time.
    #[error("receive timed out after {0:?}")]
    ReceiveTimeout(Duration),

    /// The peer closed the connection.
    #[error("connection closed by handler")]
    Closed,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes arrived that do not form a valid message.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Map this transport failure into the plugin result taxonomy.
    ///
    /// A receive timeout is a pending exchange (`Waiting`), a send timeout is a
    /// `Timeout`, and every other failure becomes the interface error of the
    /// given interface.
    pub fn to_func_error(&self, interface: InterfaceKind) -> FuncError {
        match self {
            TransportError::ReceiveTimeout(_) => FuncError::Waiting,
            TransportError::SendTimeout(_) => FuncError::Timeout,
            TransportError::Protocol(_) => FuncError::Answer,
            TransportError::Closed | TransportError::Io(_) => match interface {
                InterfaceKind::Gpib => FuncError::Gpib,
                InterfaceKind::Rs232 => FuncError::Rs232,
                InterfaceKind::Lan => FuncError::Lan,
            },
        }
    }
}
