#![forbid(unsafe_code)]

//! The uniform contract every scanner driver satisfies.
//!
//! A [`Backend`] enumerates and opens devices; an opened [`Device`]
//! describes and controls its options, negotiates scan parameters and
//! streams acquired bytes. Construction replaces the legacy `init` entry
//! point and dropping a value replaces `exit`/`close`; a driver that needs
//! exclusive hardware access is expected to take a `/tmp/LOCK.<driver>.<id>`
//! advisory lock before touching the device and release it on drop.
//!
//! Drivers never prompt for credentials themselves: they send an
//! [`AuthRequest`] through the channel handed to them at construction and
//! await the reply. The frontend on the other end answers however it
//! wants — interactively, from a file, or by relaying the challenge over
//! the network.

pub mod testdev;

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

use crate::proto::{Action, DeviceInfo, OptionDescriptor, OptionValue, Parameters, Status};
use crate::proto::Info;

/// Username/password pair answering an authorization challenge.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Maximum bytes accepted for either credential field.
pub const MAX_CREDENTIAL_LEN: usize = 128;

/// A driver's request for credentials covering `resource`.
#[derive(Debug)]
pub struct AuthRequest {
    /// The challenge, possibly suffixed `$MD5$<salt>`.
    pub resource: String,
    /// Dropped without sending to refuse the request.
    pub reply: oneshot::Sender<Credentials>,
}

/// Sending half handed to drivers at construction.
pub type AuthSender = mpsc::Sender<AuthRequest>;
/// Receiving half kept by the frontend.
pub type AuthReceiver = mpsc::Receiver<AuthRequest>;

/// Create the channel connecting a driver to its frontend's credential
/// source.
pub fn auth_channel() -> (AuthSender, AuthReceiver) {
    mpsc::channel(1)
}

/// Ask the frontend for credentials; `None` when it refused or is gone.
pub async fn request_credentials(auth: &AuthSender, resource: &str) -> Option<Credentials> {
    let (tx, rx) = oneshot::channel();
    auth.send(AuthRequest { resource: resource.to_owned(), reply: tx }).await.ok()?;
    rx.await.ok()
}

/// Driver entry point: device enumeration and opening.
pub trait Backend: Send {
    type Device: Device;

    /// Version code the driver reports during INIT.
    fn version(&self) -> i32;

    /// Enumerate available devices. The returned list is regenerated on
    /// every call.
    fn devices(
        &mut self,
        local_only: bool,
    ) -> impl Future<Output = Result<Vec<DeviceInfo>, Status>> + Send;

    /// Open a device by name; an empty name opens the first available
    /// device.
    fn open(&mut self, name: &str) -> impl Future<Output = Result<Self::Device, Status>> + Send;
}

/// An opened device.
///
/// Per-handle state machine: `idle` after open, `scanning` between a
/// successful [`start`](Device::start) and the terminal status of the
/// frame, back to `idle` after end-of-frame or cancellation. Setting
/// option values while scanning is rejected by callers.
pub trait Device: Send {
    /// Full option descriptor table. Descriptor 0 is the reserved
    /// option-count pseudo-option.
    fn descriptors(
        &mut self,
    ) -> impl Future<Output = Result<Vec<OptionDescriptor>, Status>> + Send;

    /// Read, write or auto-set option `option`.
    fn control(
        &mut self,
        option: usize,
        action: Action,
        value: OptionValue,
    ) -> impl Future<Output = Result<(Info, OptionValue), Status>> + Send;

    /// Predict (before a scan) or report (after `start`) the frame
    /// geometry.
    fn parameters(&mut self) -> impl Future<Output = Result<Parameters, Status>> + Send;

    /// Begin acquisition.
    fn start(&mut self) -> impl Future<Output = Result<(), Status>> + Send;

    /// Pull acquired bytes into `buf`.
    ///
    /// Returns the number of bytes delivered (possibly fewer than
    /// requested), `Err(Status::Eof)` at the end of the frame and
    /// `Err(Status::Cancelled)` after a cancellation took effect. Callers
    /// may drop an unresolved read future and retry; implementations must
    /// not lose data over that.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, Status>> + Send;

    /// Request termination of the current scan. Advisory: takes effect at
    /// the next `read`.
    fn cancel(&mut self) -> impl Future<Output = ()> + Send;

    /// Switch between blocking and non-blocking reads. Meaningless under
    /// an async runtime, so the default refuses.
    fn set_io_mode(
        &mut self,
        _non_blocking: bool,
    ) -> impl Future<Output = Result<(), Status>> + Send {
        async { Err(Status::Unsupported) }
    }

    /// File descriptor that becomes readable when scan data is
    /// available. Drivers living on the async runtime have none, so the
    /// default refuses.
    fn select_fd(&self) -> Result<std::os::fd::RawFd, Status> {
        Err(Status::Unsupported)
    }
}
