//! Option traffic through the net backend, including descriptor cache
//! coherence.

use sane_net::backend::auth_channel;
use sane_net::proto::options::Constraint;
use sane_net::proto::{
    version_code, Action, Cap, Info, OptionDescriptor, Parameters, Unit, ValueType,
};
use sane_net::{Backend, Device, DeviceInfo, OptionValue, ServerConfig, Status};
use tests_e2e::common::TestServer;

/// Backend whose descriptor table changes on every set, flagged with
/// RELOAD_OPTIONS.
#[derive(Clone, Default)]
struct ReloadingBackend;

struct ReloadingDevice {
    generation: i32,
}

impl Backend for ReloadingBackend {
    type Device = ReloadingDevice;

    fn version(&self) -> i32 {
        version_code(1, 0, 1)
    }

    async fn devices(&mut self, _local_only: bool) -> Result<Vec<DeviceInfo>, Status> {
        Ok(vec![DeviceInfo {
            name: "reload:0".into(),
            vendor: "Noname".into(),
            model: "Reloader".into(),
            kind: "virtual device".into(),
        }])
    }

    async fn open(&mut self, _name: &str) -> Result<ReloadingDevice, Status> {
        Ok(ReloadingDevice { generation: 0 })
    }
}

impl Device for ReloadingDevice {
    async fn descriptors(&mut self) -> Result<Vec<OptionDescriptor>, Status> {
        Ok(vec![
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
                name: Some("generation".into()),
                title: Some(format!("Generation {}", self.generation)),
                description: None,
                ty: ValueType::Int,
                unit: Unit::None,
                size: 4,
                cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
                constraint: Constraint::None,
            },
        ])
    }

    async fn control(
        &mut self,
        option: usize,
        action: Action,
        _value: OptionValue,
    ) -> Result<(Info, OptionValue), Status> {
        match (option, action) {
            (0, Action::Get) => Ok((Info::empty(), OptionValue::Words(vec![2]))),
            (1, Action::Get) => Ok((Info::empty(), OptionValue::Words(vec![self.generation]))),
            (1, Action::Set) => {
                self.generation += 1;
                Ok((Info::RELOAD_OPTIONS, OptionValue::Words(vec![self.generation])))
            }
            _ => Err(Status::Inval),
        }
    }

    async fn parameters(&mut self) -> Result<Parameters, Status> {
        Ok(Parameters::default())
    }

    async fn start(&mut self) -> Result<(), Status> {
        Err(Status::Unsupported)
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Status> {
        Err(Status::Inval)
    }

    async fn cancel(&mut self) {}
}

/// A RELOAD_OPTIONS reply invalidates the client's descriptor cache; the
/// next descriptor access refetches over the wire.
#[tokio::test]
async fn reload_options_invalidates_the_cache() {
    let server = TestServer::spawn_with(ServerConfig::default(), |_| ReloadingBackend).await;
    let (auth_tx, _rx) = auth_channel();
    let mut backend = server.client(auth_tx);
    let mut dev = backend
        .open(&format!("{}:reload:0", server.addr.ip()))
        .await
        .unwrap();

    let before = dev.descriptors().await.unwrap();
    assert_eq!(before[1].title.as_deref(), Some("Generation 0"));

    let (info, value) = dev
        .control(1, Action::Set, OptionValue::Words(vec![1]))
        .await
        .unwrap();
    assert!(info.contains(Info::RELOAD_OPTIONS));
    assert_eq!(value, OptionValue::Words(vec![1]));

    let after = dev.descriptors().await.unwrap();
    assert_eq!(after[1].title.as_deref(), Some("Generation 1"));
}

/// String options travel intact in both directions.
#[tokio::test]
async fn string_option_round_trip() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let (auth_tx, _rx) = auth_channel();
    let mut backend = server.client(auth_tx);
    let mut dev = backend.open(&server.device_name()).await.unwrap();

    let (_, value) = dev.control(1, Action::Get, OptionValue::Empty).await.unwrap();
    assert_eq!(value, OptionValue::Text(Some("Gray".into())));

    let (info, value) = dev
        .control(1, Action::Set, OptionValue::Text(Some("Color".into())))
        .await
        .unwrap();
    assert!(info.contains(Info::RELOAD_PARAMS));
    assert_eq!(value, OptionValue::Text(Some("Color".into())));

    let params = dev.parameters().await.unwrap();
    assert_eq!(params.format, sane_net::proto::Frame::Rgb);
    dev.close().await;
}

/// Out-of-range options are rejected client-side without touching the
/// wire protocol state.
#[tokio::test]
async fn out_of_range_option_is_inval() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let (auth_tx, _rx) = auth_channel();
    let mut backend = server.client(auth_tx);
    let mut dev = backend.open(&server.device_name()).await.unwrap();

    let err = dev.control(99, Action::Get, OptionValue::Empty).await.err();
    assert_eq!(err, Some(Status::Inval));

    // The connection is still healthy.
    let (_, value) = dev.control(0, Action::Get, OptionValue::Empty).await.unwrap();
    assert_eq!(value, OptionValue::Words(vec![4]));
}
