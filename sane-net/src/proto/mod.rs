#![forbid(unsafe_code)]

//! Protocol-level types: procedure numbers, the status taxonomy, option
//! metadata and the request/reply messages exchanged over the wire.

pub mod messages;
pub mod options;

pub use messages::{
    AuthorizeRequest, ControlOptionReply, ControlOptionRequest, GetDevicesReply,
    GetParametersReply, InitReply, InitRequest, OpenReply, OptionDescriptorsReply, StartReply,
};
pub use options::{Constraint, DeviceInfo, OptionDescriptor, OptionValue, Parameters, Range};

use crate::wire::WireError;

/// Backend (and protocol) major version. Peers with a different major are
/// rejected during INIT.
pub const VERSION_MAJOR: u8 = 1;
/// Backend minor version.
pub const VERSION_MINOR: u8 = 0;
/// Protocol revision carried in the build field of the version code.
pub const PROTOCOL_VERSION: u16 = 3;
/// Oldest protocol revision the binary codec is compatible with.
pub const PROTOCOL_VERSION_MIN: u16 = 2;

/// Default TCP port of the `sane-port` service.
pub const SANE_PORT: u16 = 6566;
/// mDNS service type advertised by the daemon.
pub const SERVICE_DNS: &str = "_sane-port._tcp";

/// `START_REPLY.byte_order` value denoting a little-endian server.
pub const LITTLE_ENDIAN_MAGIC: i32 = 0x1234;
/// `START_REPLY.byte_order` value denoting a big-endian server.
pub const BIG_ENDIAN_MAGIC: i32 = 0x4321;

/// Record length announcing a status terminator on the data channel.
pub const RECORD_TERMINATOR: u32 = 0xffff_ffff;

/// Pack a `(major, minor, build)` triple into a version-code word.
pub const fn version_code(major: u8, minor: u8, build: u16) -> i32 {
    ((major as i32) << 24) | ((minor as i32) << 16) | (build as i32)
}

pub const fn version_major(code: i32) -> u8 {
    ((code >> 24) & 0xff) as u8
}

pub const fn version_minor(code: i32) -> u8 {
    ((code >> 16) & 0xff) as u8
}

pub const fn version_build(code: i32) -> u16 {
    (code & 0xffff) as u16
}

/// Outcome of every backend operation and every RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Good,
    Unsupported,
    Cancelled,
    DeviceBusy,
    Inval,
    Eof,
    Jammed,
    NoDocs,
    CoverOpen,
    IoError,
    NoMem,
    AccessDenied,
}

impl Status {
    pub fn to_word(self) -> i32 {
        match self {
            Status::Good => 0,
            Status::Unsupported => 1,
            Status::Cancelled => 2,
            Status::DeviceBusy => 3,
            Status::Inval => 4,
            Status::Eof => 5,
            Status::Jammed => 6,
            Status::NoDocs => 7,
            Status::CoverOpen => 8,
            Status::IoError => 9,
            Status::NoMem => 10,
            Status::AccessDenied => 11,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => Status::Good,
            1 => Status::Unsupported,
            2 => Status::Cancelled,
            3 => Status::DeviceBusy,
            4 => Status::Inval,
            5 => Status::Eof,
            6 => Status::Jammed,
            7 => Status::NoDocs,
            8 => Status::CoverOpen,
            9 => Status::IoError,
            10 => Status::NoMem,
            11 => Status::AccessDenied,
            other => return Err(WireError::bad("status", other as i64)),
        })
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Good => "no error",
            Status::Unsupported => "operation is not supported",
            Status::Cancelled => "operation was cancelled",
            Status::DeviceBusy => "device is busy",
            Status::Inval => "invalid argument",
            Status::Eof => "end of file reached",
            Status::Jammed => "document feeder jammed",
            Status::NoDocs => "document feeder out of documents",
            Status::CoverOpen => "scanner cover is open",
            Status::IoError => "device i/o error",
            Status::NoMem => "out of memory",
            Status::AccessDenied => "access to resource has been denied",
        };
        f.write_str(s)
    }
}

/// RPC procedure numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    Init,
    GetDevices,
    Open,
    Close,
    GetOptionDescriptors,
    ControlOption,
    GetParameters,
    Start,
    Cancel,
    Authorize,
    Exit,
}

impl Procedure {
    pub fn to_word(self) -> i32 {
        match self {
            Procedure::Init => 0,
            Procedure::GetDevices => 1,
            Procedure::Open => 2,
            Procedure::Close => 3,
            Procedure::GetOptionDescriptors => 4,
            Procedure::ControlOption => 5,
            Procedure::GetParameters => 6,
            Procedure::Start => 7,
            Procedure::Cancel => 8,
            Procedure::Authorize => 9,
            Procedure::Exit => 10,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => Procedure::Init,
            1 => Procedure::GetDevices,
            2 => Procedure::Open,
            3 => Procedure::Close,
            4 => Procedure::GetOptionDescriptors,
            5 => Procedure::ControlOption,
            6 => Procedure::GetParameters,
            7 => Procedure::Start,
            8 => Procedure::Cancel,
            9 => Procedure::Authorize,
            10 => Procedure::Exit,
            other => return Err(WireError::bad("procedure", other as i64)),
        })
    }
}

/// Value type of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Fixed,
    String,
    Button,
    Group,
}

impl ValueType {
    pub fn to_word(self) -> i32 {
        match self {
            ValueType::Bool => 0,
            ValueType::Int => 1,
            ValueType::Fixed => 2,
            ValueType::String => 3,
            ValueType::Button => 4,
            ValueType::Group => 5,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => ValueType::Bool,
            1 => ValueType::Int,
            2 => ValueType::Fixed,
            3 => ValueType::String,
            4 => ValueType::Button,
            5 => ValueType::Group,
            other => return Err(WireError::bad("value type", other as i64)),
        })
    }
}

/// Physical unit of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    None,
    Pixel,
    Bit,
    Mm,
    Dpi,
    Percent,
    Microsecond,
}

impl Unit {
    pub fn to_word(self) -> i32 {
        match self {
            Unit::None => 0,
            Unit::Pixel => 1,
            Unit::Bit => 2,
            Unit::Mm => 3,
            Unit::Dpi => 4,
            Unit::Percent => 5,
            Unit::Microsecond => 6,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => Unit::None,
            1 => Unit::Pixel,
            2 => Unit::Bit,
            3 => Unit::Mm,
            4 => Unit::Dpi,
            5 => Unit::Percent,
            6 => Unit::Microsecond,
            other => return Err(WireError::bad("unit", other as i64)),
        })
    }
}

/// What a CONTROL_OPTION request does with the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Get,
    Set,
    SetAuto,
}

impl Action {
    pub fn to_word(self) -> i32 {
        match self {
            Action::Get => 0,
            Action::Set => 1,
            Action::SetAuto => 2,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => Action::Get,
            1 => Action::Set,
            2 => Action::SetAuto,
            other => return Err(WireError::bad("action", other as i64)),
        })
    }
}

/// Frame format of acquired image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Gray,
    Rgb,
    Red,
    Green,
    Blue,
}

impl Frame {
    pub fn to_word(self) -> i32 {
        match self {
            Frame::Gray => 0,
            Frame::Rgb => 1,
            Frame::Red => 2,
            Frame::Green => 3,
            Frame::Blue => 4,
        }
    }

    pub fn from_word(w: i32) -> Result<Self, WireError> {
        Ok(match w {
            0 => Frame::Gray,
            1 => Frame::Rgb,
            2 => Frame::Red,
            3 => Frame::Green,
            4 => Frame::Blue,
            other => return Err(WireError::bad("frame format", other as i64)),
        })
    }
}

bitflags::bitflags! {
    /// Capability bits of an option descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cap: i32 {
        const SOFT_SELECT = 1;
        const HARD_SELECT = 2;
        const SOFT_DETECT = 4;
        const EMULATED = 8;
        const AUTOMATIC = 16;
        const INACTIVE = 32;
        const ADVANCED = 64;
    }
}

bitflags::bitflags! {
    /// Side effects reported by a CONTROL_OPTION reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Info: i32 {
        const INEXACT = 1;
        const RELOAD_OPTIONS = 2;
        const RELOAD_PARAMS = 4;
    }
}

/// Signed fixed-point value with 16 fraction bits, carried in one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed(pub i32);

impl Fixed {
    pub const SCALE: i32 = 1 << 16;

    pub fn from_f64(v: f64) -> Self {
        Fixed((v * Self::SCALE as f64) as i32)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_code_packs_fields() {
        let code = version_code(1, 0, 3);
        assert_eq!(code, 0x0100_0003);
        assert_eq!(version_major(code), 1);
        assert_eq!(version_minor(code), 0);
        assert_eq!(version_build(code), 3);
    }

    #[test]
    fn status_words_match_the_taxonomy() {
        assert_eq!(Status::Good.to_word(), 0);
        assert_eq!(Status::Eof.to_word(), 5);
        assert_eq!(Status::AccessDenied.to_word(), 11);
        for w in 0..=11 {
            assert_eq!(Status::from_word(w).unwrap().to_word(), w);
        }
        assert!(Status::from_word(12).is_err());
    }

    #[test]
    fn procedure_numbers_are_stable() {
        assert_eq!(Procedure::Init.to_word(), 0);
        assert_eq!(Procedure::ControlOption.to_word(), 5);
        assert_eq!(Procedure::Authorize.to_word(), 9);
        assert_eq!(Procedure::Exit.to_word(), 10);
    }

    #[test]
    fn fixed_point_round_trips() {
        let v = Fixed::from_f64(12.5);
        assert_eq!(v.0, 12 * Fixed::SCALE + Fixed::SCALE / 2);
        assert!((v.to_f64() - 12.5).abs() < 1e-9);
        assert_eq!(Fixed::from_f64(-1.0).0, -Fixed::SCALE);
    }
}
