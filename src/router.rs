//! Inbound frame classification.
//!
//! Each frame is decoded once into a closed route enum and then matched
//! exhaustively by the device or client endpoint. Precedence follows the
//! wire protocol: control codes first, then peer exit, then channel, GPIO
//! input, GPIO output and finally the administrative requests.

use crate::frame::{EndpointId, Frame};

/// Whether a frame belongs to the session layer.
pub fn control_code(frame: &Frame) -> Option<u16> {
    frame.code()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Watch,
    Unwatch,
    Get,
}

impl ResourceOp {
    fn of(frame: &Frame) -> Self {
        if frame.flag("event") {
            ResourceOp::Watch
        } else if frame.flag("unwatch") {
            ResourceOp::Unwatch
        } else {
            ResourceOp::Get
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    Restart,
    UpdateCode,
    UploadCode,
    UploadEventLog,
}

impl AdminOp {
    fn of(frame: &Frame) -> Option<Self> {
        if frame.flag("restart") {
            Some(AdminOp::Restart)
        } else if frame.flag("updateCode") {
            Some(AdminOp::UpdateCode)
        } else if frame.flag("uploadCode") {
            Some(AdminOp::UploadCode)
        } else if frame.flag("uploadEventLog") {
            Some(AdminOp::UploadEventLog)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRoute {
    /// A client went away; its watches must go too.
    PeerExit { owner: String },
    Channel { name: Option<String>, op: ResourceOp },
    Input { pin: Option<u32>, op: ResourceOp },
    Output { pin: Option<u32>, op: ResourceOp },
    SetupData,
    Status,
    Admin(AdminOp),
    Enable(bool),
}

fn is_channel(frame: &Frame) -> bool {
    frame.flag("channel") || frame.contains("name")
}

fn is_input(frame: &Frame) -> bool {
    frame.flag("gpioInput") || frame.flag("input")
}

fn is_output(frame: &Frame) -> bool {
    frame.flag("gpioOutput") || frame.flag("output")
}

/// The client a request came from. Watch ownership is keyed on it.
pub fn owner_of(frame: &Frame) -> Option<String> {
    frame
        .app_id()
        .map(str::to_string)
        .or_else(|| frame.str_field("uid").map(str::to_string))
}

/// Routes a frame received by a device. Frames addressed to another device
/// or echoed back from a device are dropped.
pub fn route_device(frame: &Frame, own_id: &EndpointId) -> Option<DeviceRoute> {
    if frame.id().as_ref() != Some(own_id) {
        tracing::debug!(id = ?frame.id(), "dropping frame for another device");
        return None;
    }
    if frame.str_field("src") == Some("device") {
        tracing::debug!("dropping frame echoed from a device");
        return None;
    }
    if frame.flag("exit") {
        return owner_of(frame).map(|owner| DeviceRoute::PeerExit { owner });
    }
    if is_channel(frame) {
        return Some(DeviceRoute::Channel {
            name: frame.name().map(str::to_string),
            op: ResourceOp::of(frame),
        });
    }
    if is_input(frame) {
        return Some(DeviceRoute::Input {
            pin: frame.pin(),
            op: ResourceOp::of(frame),
        });
    }
    if is_output(frame) {
        return Some(DeviceRoute::Output {
            pin: frame.pin(),
            op: ResourceOp::of(frame),
        });
    }
    if frame.flag("setupData") {
        return Some(DeviceRoute::SetupData);
    }
    if frame.flag("status") {
        return Some(DeviceRoute::Status);
    }
    if let Some(op) = AdminOp::of(frame) {
        return Some(DeviceRoute::Admin(op));
    }
    match frame.get("enable").and_then(|v| v.as_bool()) {
        Some(enable) => Some(DeviceRoute::Enable(enable)),
        None => {
            tracing::debug!("unroutable device frame");
            None
        }
    }
}

/// What a client request or device reply is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Channel(String),
    /// GPIO requests are told apart by `_pid` (`gpio-input`, `gpio-output-on`, ...).
    Gpio { pid: String, pin: u32 },
    /// Any other request answered by a single reply, keyed by `_pid`.
    Reply(String),
}

/// Correlates a device reply with the client request that caused it.
///
/// The key is a pure function of fields the device echoes back unchanged,
/// so the request and its replies compute the same key without any
/// request-id table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub device: EndpointId,
    pub subject: Subject,
    pub event: bool,
    pub watch: bool,
    pub unwatch: bool,
}

impl CorrelationKey {
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let device = frame.id()?;
        let subject = if is_channel(frame) {
            Subject::Channel(frame.name()?.to_string())
        } else if is_input(frame) || is_output(frame) {
            Subject::Gpio {
                pid: frame.pid()?.to_string(),
                pin: frame.pin()?,
            }
        } else {
            Subject::Reply(frame.pid()?.to_string())
        };
        Some(Self {
            device,
            subject,
            event: frame.flag("event"),
            watch: frame.flag("watch"),
            unwatch: frame.contains("unwatch"),
        })
    }

    /// The key of the standing watch an unwatch request cancels.
    pub fn watch_counterpart(&self) -> Self {
        Self {
            device: self.device.clone(),
            subject: self.subject.clone(),
            event: true,
            watch: true,
            unwatch: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRoute {
    DeviceOnline(EndpointId),
    DeviceOffline(EndpointId),
    Status,
    Admin(AdminOp),
    RegisteredDevices,
    Deliver(CorrelationKey),
}

/// Routes a frame received by a client. Replies must carry this client's
/// app id; device lifecycle notices from the relay are exempt.
pub fn route_client(frame: &Frame, own_app_id: &str) -> Option<ClientRoute> {
    let lifecycle = frame.flag("activeStart") || frame.flag("exit");
    match frame.app_id() {
        Some(app_id) if app_id != own_app_id => {
            tracing::debug!(app_id, "dropping frame for another client");
            return None;
        }
        None if !lifecycle => {
            tracing::debug!("dropping frame without app id");
            return None;
        }
        _ => {}
    }
    if frame.flag("activeStart") {
        return frame.id().map(ClientRoute::DeviceOnline);
    }
    if frame.flag("exit") {
        return frame.id().map(ClientRoute::DeviceOffline);
    }
    if frame.flag("status") && !frame.flag("response") {
        return Some(ClientRoute::Status);
    }
    if let Some(op) = AdminOp::of(frame) {
        if !frame.flag("response") {
            return Some(ClientRoute::Admin(op));
        }
    }
    if frame.flag("getRegisteredDevices") {
        return Some(ClientRoute::RegisteredDevices);
    }
    match CorrelationKey::from_frame(frame) {
        Some(key) => Some(ClientRoute::Deliver(key)),
        None => {
            tracing::debug!("uncorrelatable client frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> Frame {
        Frame::from_map(value.as_object().cloned().unwrap())
    }

    #[test]
    fn device_drops_foreign_and_echoed_frames() {
        let own = EndpointId::Num(100);
        assert_eq!(route_device(&frame(json!({"id":200,"name":"temp"})), &own), None);
        assert_eq!(
            route_device(&frame(json!({"id":100,"name":"temp","src":"device"})), &own),
            None
        );
    }

    #[test]
    fn device_routes_in_precedence_order() {
        let own = EndpointId::Num(100);
        assert_eq!(
            route_device(&frame(json!({"id":100,"appId":"c1","exit":true,"name":"temp"})), &own),
            Some(DeviceRoute::PeerExit { owner: "c1".into() })
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"name":"temp","event":true})), &own),
            Some(DeviceRoute::Channel { name: Some("temp".into()), op: ResourceOp::Watch })
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"name":"temp","event":false,"unwatch":true})), &own),
            Some(DeviceRoute::Channel { name: Some("temp".into()), op: ResourceOp::Unwatch })
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"gpioInput":true,"input":true,"pin":11})), &own),
            Some(DeviceRoute::Input { pin: Some(11), op: ResourceOp::Get })
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"gpioOutput":true,"output":"on","pin":33})), &own),
            Some(DeviceRoute::Output { pin: Some(33), op: ResourceOp::Get })
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"setupData":true})), &own),
            Some(DeviceRoute::SetupData)
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"uploadEventLog":true})), &own),
            Some(DeviceRoute::Admin(AdminOp::UploadEventLog))
        );
        assert_eq!(
            route_device(&frame(json!({"id":100,"enable":false})), &own),
            Some(DeviceRoute::Enable(false))
        );
        assert_eq!(route_device(&frame(json!({"id":100})), &own), None);
    }

    #[test]
    fn request_and_reply_share_a_key() {
        let request = frame(json!({
            "id":100,"appId":"c1","_pid":"channel-data","name":"temp","channel":true,
            "event":true,"watch":true,"interval":2000,"dst":"device","src":"client"
        }));
        let mut reply = request.clone().into_response(crate::session::descriptor::Role::Device);
        reply.set("result", 21.5);
        assert_eq!(CorrelationKey::from_frame(&request), CorrelationKey::from_frame(&reply));
    }

    #[test]
    fn unwatch_reply_correlates_whatever_its_result() {
        let request = frame(json!({"id":100,"name":"temp","event":false,"unwatch":true}));
        let reply = frame(json!({"id":100,"name":"temp","event":false,"unwatch":false}));
        let key = CorrelationKey::from_frame(&request).unwrap();
        assert_eq!(Some(key.clone()), CorrelationKey::from_frame(&reply));
        let watch = frame(json!({"id":100,"name":"temp","event":true,"watch":true}));
        assert_eq!(Some(key.watch_counterpart()), CorrelationKey::from_frame(&watch));
    }

    #[test]
    fn gpio_keys_include_pid_and_pin() {
        let on = frame(json!({"id":100,"gpioOutput":true,"_pid":"gpio-output-on","pin":33}));
        let off = frame(json!({"id":100,"gpioOutput":true,"_pid":"gpio-output-off","pin":33}));
        assert_ne!(CorrelationKey::from_frame(&on), CorrelationKey::from_frame(&off));
    }

    #[test]
    fn client_checks_app_id_but_accepts_lifecycle_notices() {
        assert_eq!(route_client(&frame(json!({"id":100,"appId":"other","name":"temp"})), "c1"), None);
        assert_eq!(route_client(&frame(json!({"id":100,"name":"temp"})), "c1"), None);
        assert_eq!(
            route_client(&frame(json!({"id":100,"exit":true})), "c1"),
            Some(ClientRoute::DeviceOffline(EndpointId::Num(100)))
        );
        assert_eq!(
            route_client(&frame(json!({"id":100,"activeStart":true})), "c1"),
            Some(ClientRoute::DeviceOnline(EndpointId::Num(100)))
        );
        assert!(matches!(
            route_client(&frame(json!({"id":100,"appId":"c1","name":"temp","result":1})), "c1"),
            Some(ClientRoute::Deliver(_))
        ));
    }
}
