//! Request and reply messages of the RPC surface.
//!
//! Both peers encode and decode every shape: the client sends requests
//! and reads replies, the daemon does the opposite, and the codec tests
//! exercise the round trip.

use tokio::io::AsyncRead;

use crate::proto::options::{DeviceInfo, OptionDescriptor, OptionValue, Parameters};
use crate::proto::{Action, Info, Status, ValueType};
use crate::wire::{WireError, WireReader, WireWriter};

/// INIT request: the client's version code and advisory user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub version_code: i32,
    pub username: Option<String>,
}

impl InitRequest {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.version_code);
        w.put_string(self.username.as_deref());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(InitRequest {
            version_code: r.read_word().await?,
            username: r.read_string().await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReply {
    pub status: Status,
    pub version_code: i32,
}

impl InitReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        w.put_word(self.version_code);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(InitReply {
            status: Status::from_word(r.read_word().await?)?,
            version_code: r.read_word().await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDevicesReply {
    pub status: Status,
    pub devices: Vec<DeviceInfo>,
}

impl GetDevicesReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        w.put_word(self.devices.len() as i32);
        for device in &self.devices {
            w.put_ptr_flag(true);
            device.write(w);
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        let status = Status::from_word(r.read_word().await?)?;
        let n = r.read_len(4).await?;
        let mut devices = Vec::new();
        for _ in 0..n {
            if r.read_ptr_flag().await? {
                devices.push(DeviceInfo::read(r).await?);
            }
        }
        Ok(GetDevicesReply { status, devices })
    }
}

/// OPEN reply; `resource_to_authorize` restarts the reply cycle when set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenReply {
    pub status: Status,
    pub handle: i32,
    pub resource_to_authorize: Option<String>,
}

impl OpenReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        w.put_word(self.handle);
        w.put_string(self.resource_to_authorize.as_deref());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(OpenReply {
            status: Status::from_word(r.read_word().await?)?,
            handle: r.read_word().await?,
            resource_to_authorize: r.read_string().await?,
        })
    }
}

/// GET_OPTION_DESCRIPTORS reply: just the descriptor array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDescriptorsReply {
    pub descriptors: Vec<OptionDescriptor>,
}

impl OptionDescriptorsReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.descriptors.len() as i32);
        for desc in &self.descriptors {
            w.put_ptr_flag(true);
            desc.write(w);
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        let n = r.read_len(4).await?;
        let mut descriptors = Vec::new();
        for _ in 0..n {
            if r.read_ptr_flag().await? {
                descriptors.push(OptionDescriptor::read(r).await?);
            }
        }
        Ok(OptionDescriptorsReply { descriptors })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlOptionRequest {
    pub handle: i32,
    pub option: i32,
    pub action: Action,
    pub value_type: ValueType,
    /// Bytes of value storage on the caller side; for strings this is the
    /// buffer capacity, which may exceed the sent string.
    pub value_size: i32,
    pub value: OptionValue,
}

impl ControlOptionRequest {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.handle);
        w.put_word(self.option);
        w.put_word(self.action.to_word());
        w.put_word(self.value_type.to_word());
        w.put_word(self.value_size);
        self.value.write(w, self.value_type);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        let handle = r.read_word().await?;
        let option = r.read_word().await?;
        let action = Action::from_word(r.read_word().await?)?;
        let value_type = ValueType::from_word(r.read_word().await?)?;
        let value_size = r.read_word().await?;
        let value = OptionValue::read(r, value_type).await?;
        Ok(ControlOptionRequest { handle, option, action, value_type, value_size, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlOptionReply {
    pub status: Status,
    pub info: Info,
    pub value_type: ValueType,
    pub value_size: i32,
    pub value: OptionValue,
    pub resource_to_authorize: Option<String>,
}

impl ControlOptionReply {
    /// Partial reply carrying only an authorization challenge.
    pub fn challenge(resource: &str) -> Self {
        ControlOptionReply {
            status: Status::Good,
            info: Info::empty(),
            value_type: ValueType::Bool,
            value_size: 0,
            value: OptionValue::Words(Vec::new()),
            resource_to_authorize: Some(resource.to_owned()),
        }
    }

    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        w.put_word(self.info.bits());
        w.put_word(self.value_type.to_word());
        w.put_word(self.value_size);
        self.value.write(w, self.value_type);
        w.put_string(self.resource_to_authorize.as_deref());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        let status = Status::from_word(r.read_word().await?)?;
        let info = Info::from_bits_truncate(r.read_word().await?);
        let value_type = ValueType::from_word(r.read_word().await?)?;
        let value_size = r.read_word().await?;
        let value = OptionValue::read(r, value_type).await?;
        let resource_to_authorize = r.read_string().await?;
        Ok(ControlOptionReply { status, info, value_type, value_size, value, resource_to_authorize })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetParametersReply {
    pub status: Status,
    pub params: Parameters,
}

impl GetParametersReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        self.params.write(w);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(GetParametersReply {
            status: Status::from_word(r.read_word().await?)?,
            params: Parameters::read(r).await?,
        })
    }
}

/// START reply: the data port, the server's native byte order and an
/// optional authorization challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReply {
    pub status: Status,
    pub port: i32,
    pub byte_order: i32,
    pub resource_to_authorize: Option<String>,
}

impl StartReply {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.status.to_word());
        w.put_word(self.port);
        w.put_word(self.byte_order);
        w.put_string(self.resource_to_authorize.as_deref());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(StartReply {
            status: Status::from_word(r.read_word().await?)?,
            port: r.read_word().await?,
            byte_order: r.read_word().await?,
            resource_to_authorize: r.read_string().await?,
        })
    }
}

/// AUTHORIZE request answering a challenge. The word ack that follows it
/// has no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub resource: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthorizeRequest {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_string(self.resource.as_deref());
        w.put_string(self.username.as_deref());
        w.put_string(self.password.as_deref());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self, WireError> {
        Ok(AuthorizeRequest {
            resource: r.read_string().await?,
            username: r.read_string().await?,
            password: r.read_string().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::options::{Constraint, Range};
    use crate::proto::{Cap, Frame, Unit};

    async fn flushed<F: FnOnce(&mut WireWriter<Vec<u8>>)>(f: F) -> Vec<u8> {
        let mut w = WireWriter::new(Vec::new());
        f(&mut w);
        w.flush().await.unwrap();
        w.into_inner()
    }

    #[tokio::test]
    async fn init_request_matches_handshake_bytes() {
        let req = InitRequest { version_code: 0x0100_0003, username: Some("alice".into()) };
        let bytes = flushed(|w| req.write(w)).await;
        assert_eq!(
            bytes,
            [0x01, 0, 0, 0x03, 0, 0, 0, 6, b'a', b'l', b'i', b'c', b'e', 0]
        );
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(InitRequest::read(&mut r).await.unwrap(), req);
    }

    #[tokio::test]
    async fn init_reply_matches_handshake_bytes() {
        let reply = InitReply { status: Status::Good, version_code: 0x0100_0003 };
        let bytes = flushed(|w| reply.write(w)).await;
        assert_eq!(bytes, [0, 0, 0, 0, 0x01, 0, 0, 0x03]);
    }

    #[tokio::test]
    async fn empty_device_list_is_status_and_zero_count() {
        let reply = GetDevicesReply { status: Status::Good, devices: Vec::new() };
        let bytes = flushed(|w| reply.write(w)).await;
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn device_list_round_trips() {
        let reply = GetDevicesReply {
            status: Status::Good,
            devices: vec![DeviceInfo {
                name: "remote:test:0".into(),
                vendor: "Noname".into(),
                model: "Frontend-tester".into(),
                kind: "virtual device".into(),
            }],
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(GetDevicesReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn open_reply_round_trips_with_challenge() {
        let reply = OpenReply {
            status: Status::Good,
            handle: 0,
            resource_to_authorize: Some("test:0$MD5$abcdefgh".into()),
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(OpenReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn control_option_request_round_trips() {
        let req = ControlOptionRequest {
            handle: 3,
            option: 2,
            action: Action::Set,
            value_type: ValueType::Int,
            value_size: 4,
            value: OptionValue::Words(vec![300]),
        };
        let bytes = flushed(|w| req.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(ControlOptionRequest::read(&mut r).await.unwrap(), req);
    }

    #[tokio::test]
    async fn control_option_reply_round_trips_string_value() {
        let reply = ControlOptionReply {
            status: Status::Good,
            info: Info::RELOAD_OPTIONS,
            value_type: ValueType::String,
            value_size: 16,
            value: OptionValue::Text(Some("Color".into())),
            resource_to_authorize: None,
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(ControlOptionReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn descriptor_array_round_trips() {
        let reply = OptionDescriptorsReply {
            descriptors: vec![
                OptionDescriptor {
                    name: None,
                    title: Some("Number of options".into()),
                    description: None,
                    ty: ValueType::Int,
                    unit: Unit::None,
                    size: 4,
                    cap: Cap::SOFT_DETECT,
                    constraint: Constraint::None,
                },
                OptionDescriptor {
                    name: Some("br-x".into()),
                    title: Some("Bottom-right x".into()),
                    description: Some("Bottom-right x position of scan area".into()),
                    ty: ValueType::Fixed,
                    unit: Unit::Mm,
                    size: 4,
                    cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
                    constraint: Constraint::Range(Range { min: 0, max: 13_926_400, quant: 0 }),
                },
            ],
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(OptionDescriptorsReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn start_reply_round_trips() {
        let reply = StartReply {
            status: Status::Good,
            port: 6567,
            byte_order: crate::proto::LITTLE_ENDIAN_MAGIC,
            resource_to_authorize: None,
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(StartReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn get_parameters_reply_round_trips() {
        let reply = GetParametersReply {
            status: Status::Good,
            params: Parameters {
                format: Frame::Gray,
                last_frame: true,
                bytes_per_line: 850,
                pixels_per_line: 850,
                lines: 1170,
                depth: 8,
            },
        };
        let bytes = flushed(|w| reply.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(GetParametersReply::read(&mut r).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn authorize_request_round_trips() {
        let req = AuthorizeRequest {
            resource: Some("test:0$MD5$abcdefgh".into()),
            username: Some("bob".into()),
            password: Some("$MD5$0123456789abcdef0123456789abcdef".into()),
        };
        let bytes = flushed(|w| req.write(w)).await;
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(AuthorizeRequest::read(&mut r).await.unwrap(), req);
    }
}
