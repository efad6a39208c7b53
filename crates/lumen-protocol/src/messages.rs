//! Parameter and result messages carried inside the envelopes

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    CarriesFds, FdAttachError, FdGroup, FdSets, ResponseShape, SideChannel, attach_in_order,
    declared_sizes, extract_in_order,
};

/// Decoded parameters of one operation
pub trait ParameterMessage: CarriesFds + Serialize + DeserializeOwned + Send + 'static {}

/// Result of one operation; every result can report a handler error
pub trait ResultMessage:
    CarriesFds + Serialize + DeserializeOwned + Default + Send + 'static
{
    const SHAPE: ResponseShape;

    fn error(&self) -> Option<&str>;

    fn set_error(&mut self, message: String);

    /// A result carrying only an error description
    fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.set_error(message.into());
        result
    }
}

macro_rules! result_message {
    ($ty:ty, $shape:expr) => {
        impl ResultMessage for $ty {
            const SHAPE: ResponseShape = $shape;

            fn error(&self) -> Option<&str> {
                self.error.as_deref()
            }

            fn set_error(&mut self, message: String) {
                self.error = Some(message);
            }
        }
    };
}

/// Empty message; also the result of operations with nothing to return
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Void {
    pub error: Option<String>,
}

impl CarriesFds for Void {}
impl ParameterMessage for Void {}
result_message!(Void, ResponseShape::NoFds);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParameters {
    pub application_name: String,
}

impl CarriesFds for ConnectParameters {}
impl ParameterMessage for ConnectParameters {}

/// Platform details handed to a client on connect
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Platform {
    pub data: Vec<i32>,
    pub side_channel: SideChannel,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Connection {
    pub platform: Option<Platform>,
    pub display_configuration: Option<DisplayConfiguration>,
    pub surface_pixel_formats: Vec<u32>,
    pub error: Option<String>,
}

impl CarriesFds for Connection {
    fn extract_fds(&mut self) -> FdSets {
        match self.platform.as_mut() {
            Some(platform) => extract_in_order(&mut [&mut platform.side_channel]),
            None => FdSets::new(),
        }
    }

    fn declared_fd_groups(&self) -> Vec<usize> {
        match self.platform.as_ref() {
            Some(platform) => declared_sizes(&[&platform.side_channel]),
            None => Vec::new(),
        }
    }

    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        match self.platform.as_mut() {
            Some(platform) => attach_in_order(&mut [&mut platform.side_channel], groups),
            None => attach_in_order(&mut [], groups),
        }
    }
}

result_message!(Connection, ResponseShape::OneGroup);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferUsage {
    #[default]
    Software,
    Hardware,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceParameters {
    pub surface_name: String,
    pub width: i32,
    pub height: i32,
    pub pixel_format: u32,
    pub buffer_usage: BufferUsage,
}

impl CarriesFds for SurfaceParameters {}
impl ParameterMessage for SurfaceParameters {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId {
    pub value: i32,
}

impl CarriesFds for SurfaceId {}
impl ParameterMessage for SurfaceId {}

/// A shared-memory buffer; its descriptors travel on the side channel
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Buffer {
    pub buffer_id: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub side_channel: SideChannel,
    pub error: Option<String>,
}

impl CarriesFds for Buffer {
    fn extract_fds(&mut self) -> FdSets {
        extract_in_order(&mut [&mut self.side_channel])
    }

    fn declared_fd_groups(&self) -> Vec<usize> {
        declared_sizes(&[&self.side_channel])
    }

    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        attach_in_order(&mut [&mut self.side_channel], groups)
    }
}

result_message!(Buffer, ResponseShape::OneGroup);

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Surface {
    pub id: Option<SurfaceId>,
    pub width: i32,
    pub height: i32,
    pub pixel_format: u32,
    /// Surface-level descriptors (the client end of its event channel)
    pub side_channel: SideChannel,
    pub buffer: Option<Buffer>,
    pub error: Option<String>,
}

impl CarriesFds for Surface {
    fn extract_fds(&mut self) -> FdSets {
        match self.buffer.as_mut() {
            Some(buffer) => {
                extract_in_order(&mut [&mut self.side_channel, &mut buffer.side_channel])
            }
            None => extract_in_order(&mut [&mut self.side_channel]),
        }
    }

    fn declared_fd_groups(&self) -> Vec<usize> {
        match self.buffer.as_ref() {
            Some(buffer) => declared_sizes(&[&self.side_channel, &buffer.side_channel]),
            None => declared_sizes(&[&self.side_channel]),
        }
    }

    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                attach_in_order(&mut [&mut self.side_channel, &mut buffer.side_channel], groups)
            }
            None => attach_in_order(&mut [&mut self.side_channel], groups),
        }
    }
}

result_message!(Surface, ResponseShape::TwoGroupsNestedOrder);

/// A client-filled buffer handed back to the server for a surface
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BufferSubmission {
    pub surface_id: SurfaceId,
    pub buffer: Buffer,
}

impl CarriesFds for BufferSubmission {
    fn extract_fds(&mut self) -> FdSets {
        self.buffer.extract_fds()
    }

    fn declared_fd_groups(&self) -> Vec<usize> {
        self.buffer.declared_fd_groups()
    }

    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        self.buffer.attach_fds(groups)
    }
}

impl ParameterMessage for BufferSubmission {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOutput {
    pub output_id: u32,
    pub connected: bool,
    pub used: bool,
    pub position_x: i32,
    pub position_y: i32,
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfiguration {
    pub outputs: Vec<DisplayOutput>,
    pub error: Option<String>,
}

impl CarriesFds for DisplayConfiguration {}
impl ParameterMessage for DisplayConfiguration {}
result_message!(DisplayConfiguration, ResponseShape::NoFds);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreencastParameters {
    pub region: Rectangle,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
}

impl CarriesFds for ScreencastParameters {}
impl ParameterMessage for ScreencastParameters {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreencastId {
    pub value: i32,
}

impl CarriesFds for ScreencastId {}
impl ParameterMessage for ScreencastId {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Screencast {
    pub id: Option<ScreencastId>,
    pub buffer: Option<Buffer>,
    pub error: Option<String>,
}

impl CarriesFds for Screencast {
    fn extract_fds(&mut self) -> FdSets {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.extract_fds(),
            None => FdSets::new(),
        }
    }

    fn declared_fd_groups(&self) -> Vec<usize> {
        match self.buffer.as_ref() {
            Some(buffer) => buffer.declared_fd_groups(),
            None => Vec::new(),
        }
    }

    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.attach_fds(groups),
            None => attach_in_order(&mut [], groups),
        }
    }
}

result_message!(Screencast, ResponseShape::OneGroup);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode};
    use std::os::fd::OwnedFd;

    fn fds(n: usize) -> Vec<OwnedFd> {
        (0..n)
            .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
            .collect()
    }

    fn buffer_with(n: usize) -> Buffer {
        Buffer {
            buffer_id: 3,
            width: 64,
            height: 32,
            stride: 256,
            side_channel: SideChannel::with_fds(fds(n)),
            error: None,
        }
    }

    #[test]
    fn surface_groups_follow_nesting_order() {
        let mut surface = Surface {
            id: Some(SurfaceId { value: 13 }),
            side_channel: SideChannel::with_fds(fds(1)),
            buffer: Some(buffer_with(2)),
            ..Default::default()
        };

        let sets = surface.extract_fds();
        assert_eq!(sets.group_sizes(), vec![1, 2]);
        assert_eq!(surface.declared_fd_groups(), vec![1, 2]);

        // The body now holds counts only
        let decoded: Surface = decode(&encode(&surface).unwrap()).unwrap();
        assert_eq!(decoded.side_channel.declared(), 1);
        assert_eq!(decoded.buffer.as_ref().unwrap().side_channel.declared(), 2);
        assert!(decoded.side_channel.fds.is_empty());
    }

    #[test]
    fn surface_without_buffer_contributes_one_group() {
        let mut surface = Surface {
            side_channel: SideChannel::with_fds(fds(1)),
            ..Default::default()
        };
        assert_eq!(surface.extract_fds().group_sizes(), vec![1]);
    }

    #[test]
    fn received_groups_reattach_to_declaring_slots() {
        let mut surface = Surface {
            side_channel: SideChannel::with_fds(fds(1)),
            buffer: Some(buffer_with(2)),
            ..Default::default()
        };
        let groups = surface.extract_fds().into_groups();

        let mut decoded: Surface = decode(&encode(&surface).unwrap()).unwrap();
        decoded.attach_fds(groups).unwrap();
        assert_eq!(decoded.side_channel.fds.len(), 1);
        assert_eq!(decoded.buffer.unwrap().side_channel.fds.len(), 2);
    }

    #[test]
    fn screencast_reports_nested_buffer_group() {
        let mut screencast = Screencast {
            id: Some(ScreencastId { value: 1 }),
            buffer: Some(buffer_with(1)),
            error: None,
        };
        assert_eq!(screencast.extract_fds().group_sizes(), vec![1]);
    }

    #[test]
    fn messages_without_fds_reject_groups() {
        let mut void = Void::default();
        assert!(void.attach_fds(vec![fds(1)]).is_err());
        assert!(void.attach_fds(Vec::new()).is_ok());
    }

    #[test]
    fn failed_result_carries_error() {
        let surface = Surface::failed("no such output");
        assert_eq!(surface.error(), Some("no such output"));
        assert!(surface.id.is_none());
    }
}
