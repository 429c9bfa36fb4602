//! Device announcement and SPIRC frames.
//!
//! After login the device makes itself known in three steps, in this order:
//!
//! 1. subscribe to the connect-state devices resource
//! 2. PUT the device state: capabilities and an idle player
//! 3. send a SPIRC Hello
//!
//! Afterwards it keeps the presence alive with periodic SPIRC Probes and
//! echoes the Probes of the access point with their own sequence number.

use std::time::{SystemTime, UNIX_EPOCH};

use protobuf::{EnumOrUnknown, Message, MessageField};
use uuid::Uuid;

use super::{
    mercury::ControlFrame,
    protos::{
        connect::{
            Capabilities, Device, DeviceInfo, DeviceType, PlayerState, PrivateDeviceInfo,
            PutStateRequest,
        },
        spirc::{Capability, CapabilityType, DeviceState, Frame, MessageType},
    },
};
use crate::{config::Config, error::Result};

/// Connect-state resource listing the devices of the user.
pub const DEVICES_URI: &str = "hm://connect-state/v1/devices";

/// SPIRC software version announced in the device info and Hello.
pub const SPIRC_VERSION: &str = "3.2.6";

/// Sequence number of the Hello frame.
pub const HELLO_SEQ: u32 = 1;

/// Sequence number of the first heartbeat Probe.
pub const FIRST_HEARTBEAT_SEQ: u32 = 2;

const FRAME_VERSION: u32 = 1;
const PROTOCOL_VERSION: &str = "1.0";

/// Builds the messages that announce this device.
///
/// Built fresh for every connection: the player state carries a new session
/// id and current timestamps each time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    device_id: String,
    name: String,
    brand: String,
    model: String,
    platform: String,
    volume: u32,
    session_id: Uuid,
}

impl Announcement {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            device_id: config.device_id.to_string(),
            name: config.device_name.clone(),
            brand: config.device_brand.clone(),
            model: config.device_model.clone(),
            platform: config.platform.clone(),
            volume: config.volume,
            session_id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the device state: capabilities and an idle, paused player.
    #[must_use]
    pub fn put_state_request(&self) -> PutStateRequest {
        let now = now_millis();

        let mut capabilities = Capabilities::new();
        capabilities.can_be_player = Some(true);
        capabilities.is_controllable = Some(true);
        capabilities.supports_logout = Some(true);
        capabilities.supports_playlist_v2 = Some(true);
        capabilities.supports_transfer_command = Some(true);
        capabilities.supports_set_backend_metadata = Some(true);
        capabilities.supports_command_request = Some(true);
        capabilities.supports_set_options_command = Some(true);
        capabilities.supported_types = vec!["audio/local".to_string()];

        let mut device_info = DeviceInfo::new();
        device_info.device_id = Some(self.device_id.clone());
        device_info.device_type = Some(EnumOrUnknown::new(DeviceType::SPEAKER));
        device_info.name = Some(self.name.clone());
        device_info.brand = Some(self.brand.clone());
        device_info.model = Some(self.model.clone());
        device_info.spirc_version = Some(SPIRC_VERSION.to_string());
        device_info.can_play = Some(true);
        device_info.volume = Some(self.volume);
        device_info.capabilities = MessageField::some(capabilities);

        let mut private_device_info = PrivateDeviceInfo::new();
        private_device_info.platform = Some(self.platform.clone());

        let mut player_state = PlayerState::new();
        player_state.timestamp = Some(now);
        player_state.position_as_of_timestamp = Some(now);
        player_state.duration = Some(0);
        player_state.position = Some(0);
        player_state.is_paused = Some(true);
        player_state.is_playing = Some(false);
        player_state.is_buffering = Some(false);
        player_state.is_system_initiated = Some(false);
        player_state.session_id = Some(self.session_id.to_string());

        let mut device = Device::new();
        device.device_info = MessageField::some(device_info);
        device.player_state = MessageField::some(player_state);
        device.private_device_info = MessageField::some(private_device_info);
        device.transfer_data = Some(vec![0x00]);

        let mut request = PutStateRequest::new();
        request.device = MessageField::some(device);
        request
    }

    /// Returns the subscription to [`DEVICES_URI`].
    pub fn subscribe_frame(&self) -> Result<Vec<u8>> {
        ControlFrame::subscribe(DEVICES_URI).encode()
    }

    /// Returns the PUT of [`Self::put_state_request`] to the device resource.
    pub fn put_frame(&self) -> Result<Vec<u8>> {
        let uri = format!("{DEVICES_URI}/{}", self.device_id);
        ControlFrame::put(uri, &self.put_state_request())?.encode()
    }

    /// Returns the SPIRC Hello.
    pub fn hello(&self) -> Result<Vec<u8>> {
        let capabilities = [
            CapabilityType::kSupportsPlaylistV2,
            CapabilityType::kSupportsLogout,
            CapabilityType::kSupportsRename,
        ]
        .into_iter()
        .map(|typ| {
            let mut capability = Capability::new();
            capability.typ = Some(EnumOrUnknown::new(typ));
            capability.int_value = vec![1];
            capability
        })
        .collect();

        let mut device_state = DeviceState::new();
        device_state.sw_version = Some(SPIRC_VERSION.to_string());
        device_state.is_active = Some(true);
        device_state.can_play = Some(true);
        device_state.volume = Some(self.volume);
        device_state.name = Some(self.name.clone());
        device_state.error_code = Some(0);
        device_state.became_active_at = Some(now_millis());
        device_state.capabilities = capabilities;

        let mut frame = self.frame(MessageType::kMessageTypeHello, HELLO_SEQ);
        frame.device_state = MessageField::some(device_state);
        Ok(frame.write_to_bytes()?)
    }

    /// Returns a SPIRC Probe with sequence number `seq_nr`.
    ///
    /// Used for both heartbeats and echoes.
    pub fn probe(&self, seq_nr: u32) -> Result<Vec<u8>> {
        Ok(self
            .frame(MessageType::kMessageTypeProbe, seq_nr)
            .write_to_bytes()?)
    }

    /// Returns the sequence number to echo if `payload` is a Probe sent by
    /// another device.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `payload` is not a SPIRC frame.
    pub fn probe_to_echo(&self, payload: &[u8]) -> Result<Option<u32>> {
        let frame = Frame::parse_from_bytes(payload)?;

        let typ = frame.typ.map(|typ| typ.enum_value_or_default());
        trace!(
            "spirc {typ:?} seq {:?} from {:?}",
            frame.seq_nr,
            frame.ident.as_deref()
        );

        if typ != Some(MessageType::kMessageTypeProbe) {
            return Ok(None);
        }
        if frame.ident.as_deref() == Some(self.device_id.as_str()) {
            trace!("ignoring own probe");
            return Ok(None);
        }

        Ok(Some(frame.seq_nr.unwrap_or_default()))
    }

    fn frame(&self, typ: MessageType, seq_nr: u32) -> Frame {
        let mut frame = Frame::new();
        frame.version = Some(FRAME_VERSION);
        frame.ident = Some(self.device_id.clone());
        frame.protocol_version = Some(PROTOCOL_VERSION.to_string());
        frame.seq_nr = Some(seq_nr);
        frame.typ = Some(EnumOrUnknown::new(typ));
        frame
    }
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}
