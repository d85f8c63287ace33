//! Device capabilities
//!
//! A capability wraps the RPC methods of one feature (power, light) and
//! keeps the last state it observed. Changes are published to the owning
//! device's [`EventTarget`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::core::{Error, Result};
use crate::event::{Event, EventTarget, Publisher};
use crate::network::Outbound;
use crate::protocol::Response;

const LIGHT_PROPS: [&str; 5] = ["bright", "color_mode", "rgb", "hue", "sat"];

/// A feature a device supports
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Polls the device and publishes an event if anything changed
    async fn update(&self) -> Result<()>;
}

/// Accepts any response to a setter that is not an error object
async fn call_checked(outbound: &Outbound, method: &str, params: Vec<Value>) -> Result<()> {
    let data = outbound.call(method, params).await?;
    let response: Response = serde_json::from_slice(&data)?;
    match response.error {
        Some(err) => Err(Error::Rpc {
            code: err.code,
            message: err.message,
        }),
        None => Ok(()),
    }
}

/// Devices report numeric properties either as numbers or as strings
fn prop_int(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn publish(events: &EventTarget, event: Event) {
    if let Err(e) = events.publish(event) {
        debug!("Dropping state update: {}", e);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Rgb { red, green, blue }
    }

    /// Splits the `0xRRGGBB` integer form devices use
    pub fn from_packed(value: u32) -> Self {
        Rgb {
            red: (value >> 16 & 0xff) as u8,
            green: (value >> 8 & 0xff) as u8,
            blue: (value & 0xff) as u8,
        }
    }

    pub fn packed(&self) -> u32 {
        (self.red as u32) << 16 | (self.green as u32) << 8 | self.blue as u32
    }
}

/// Last observed light properties
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightState {
    pub brightness: u32,
    /// 1: rgb, 2: color temperature, 3: hsv
    pub color_mode: u32,
    pub rgb: Rgb,
    pub hue: u32,
    pub saturation: u32,
}

/// Dimmable color light
pub struct Light {
    outbound: Arc<Outbound>,
    events: EventTarget,
    state: Mutex<LightState>,
}

impl Light {
    pub fn new(outbound: Arc<Outbound>, events: EventTarget) -> Self {
        Light {
            outbound,
            events,
            state: Mutex::new(LightState::default()),
        }
    }

    pub fn state(&self) -> LightState {
        *self.state.lock()
    }

    /// Sets brightness, 1 to 100
    pub async fn set_brightness(&self, brightness: u8) -> Result<()> {
        if !(1..=100).contains(&brightness) {
            return Err(Error::format(format!(
                "Brightness {} is outside 1..=100",
                brightness
            )));
        }
        call_checked(&self.outbound, "set_bright", vec![json!(brightness)]).await?;
        self.apply(|state| state.brightness = brightness as u32);
        Ok(())
    }

    /// Sets hue (0 to 359) and saturation (0 to 100)
    pub async fn set_hsv(&self, hue: u16, saturation: u8) -> Result<()> {
        if hue > 359 || saturation > 100 {
            return Err(Error::format(format!(
                "Hue {} / saturation {} out of range",
                hue, saturation
            )));
        }
        call_checked(&self.outbound, "set_hsv", vec![json!(hue), json!(saturation)]).await?;
        self.apply(|state| {
            state.hue = hue as u32;
            state.saturation = saturation as u32;
        });
        Ok(())
    }

    pub async fn set_rgb(&self, rgb: Rgb) -> Result<()> {
        call_checked(&self.outbound, "set_rgb", vec![json!(rgb.packed())]).await?;
        self.apply(|state| state.rgb = rgb);
        Ok(())
    }

    fn apply(&self, change: impl FnOnce(&mut LightState)) {
        let state = {
            let mut state = self.state.lock();
            change(&mut state);
            *state
        };
        publish(&self.events, Event::UpdateLight(state));
    }
}

#[async_trait]
impl Capability for Light {
    fn name(&self) -> &'static str {
        "light"
    }

    async fn update(&self) -> Result<()> {
        let params = LIGHT_PROPS.iter().map(|p| json!(p)).collect();
        let values: Vec<Value> = self.outbound.call_and_deserialize("get_prop", params).await?;

        let mut next = self.state();
        for (prop, value) in LIGHT_PROPS.iter().zip(&values) {
            let Some(value) = prop_int(value) else {
                debug!("Ignoring unreadable {} value {}", prop, value);
                continue;
            };
            match *prop {
                "bright" => next.brightness = value,
                "color_mode" => next.color_mode = value,
                "rgb" => next.rgb = Rgb::from_packed(value),
                "hue" => next.hue = value,
                "sat" => next.saturation = value,
                _ => {}
            }
        }

        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            publish(&self.events, Event::UpdateLight(next));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            other => Err(Error::format(format!("Unknown power state {:?}", other))),
        }
    }
}

/// On/off switch
pub struct Power {
    outbound: Arc<Outbound>,
    events: EventTarget,
    state: Mutex<Option<PowerState>>,
}

impl Power {
    pub fn new(outbound: Arc<Outbound>, events: EventTarget) -> Self {
        Power {
            outbound,
            events,
            state: Mutex::new(None),
        }
    }

    /// Last observed state, `None` before the first update
    pub fn state(&self) -> Option<PowerState> {
        *self.state.lock()
    }

    pub async fn set_power(&self, state: PowerState) -> Result<()> {
        call_checked(&self.outbound, "set_power", vec![json!(state.as_str())]).await?;
        *self.state.lock() = Some(state);
        publish(&self.events, Event::UpdatePower(state));
        Ok(())
    }
}

#[async_trait]
impl Capability for Power {
    fn name(&self) -> &'static str {
        "power"
    }

    async fn update(&self) -> Result<()> {
        let values: Vec<Value> = self
            .outbound
            .call_and_deserialize("get_prop", vec![json!("power")])
            .await?;
        let state: PowerState = match values.first().and_then(Value::as_str) {
            Some(raw) => raw.parse()?,
            None => return Err(Error::format(format!("Unexpected power response {:?}", values))),
        };

        let previous = self.state.lock().replace(state);
        if previous != Some(state) {
            publish(&self.events, Event::UpdatePower(state));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_device;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rgb_packing() {
        let rgb = Rgb::new(0x12, 0x34, 0x56);
        assert_eq!(rgb.packed(), 0x123456);
        assert_eq!(Rgb::from_packed(0x123456), rgb);
        assert_eq!(Rgb::from_packed(0xff00_0000), Rgb::default());
    }

    #[test]
    fn test_prop_int() {
        assert_eq!(prop_int(&json!(42)), Some(42));
        assert_eq!(prop_int(&json!("42")), Some(42));
        assert_eq!(prop_int(&json!("x")), None);
        assert_eq!(prop_int(&json!(-1)), None);
    }

    #[tokio::test]
    async fn test_light_update_publishes_on_change_only() {
        let (outbound, requests) =
            fake_device(|_| json!(["50", "1", "16711680", "0", "100"]));
        let events = EventTarget::new();
        let mut sub = events.subscribe().unwrap();
        let light = Light::new(outbound, events);

        light.update().await.unwrap();
        light.update().await.unwrap();

        match sub.recv().await {
            Some(Event::UpdateLight(state)) => {
                assert_eq!(state.brightness, 50);
                assert_eq!(state.color_mode, 1);
                assert_eq!(state.rgb, Rgb::new(255, 0, 0));
                assert_eq!(state.saturation, 100);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "get_prop");
        assert_eq!(requests[0].params, LIGHT_PROPS.iter().map(|p| json!(p)).collect::<Vec<_>>());

        // The second identical poll publishes nothing.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_light_setters() {
        let (outbound, requests) = fake_device(|_| json!(["ok"]));
        let events = EventTarget::new();
        let mut sub = events.subscribe().unwrap();
        let light = Light::new(outbound, events);

        light.set_brightness(30).await.unwrap();
        light.set_hsv(120, 80).await.unwrap();
        light.set_rgb(Rgb::new(0, 0, 255)).await.unwrap();
        assert!(light.set_brightness(0).await.is_err());
        assert!(light.set_hsv(360, 0).await.is_err());

        let requests = requests.lock();
        let calls: Vec<_> = requests
            .iter()
            .map(|r| (r.method.as_str(), r.params.clone()))
            .collect();
        assert_eq!(
            calls,
            vec![
                ("set_bright", vec![json!(30)]),
                ("set_hsv", vec![json!(120), json!(80)]),
                ("set_rgb", vec![json!(255)]),
            ]
        );

        let mut last = None;
        for _ in 0..3 {
            if let Some(Event::UpdateLight(state)) = sub.recv().await {
                last = Some(state);
            }
        }
        let last = last.unwrap();
        assert_eq!(last.brightness, 30);
        assert_eq!(last.hue, 120);
        assert_eq!(last.rgb.blue, 255);
    }

    #[tokio::test]
    async fn test_setter_accepts_null_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (outbound, _) = fake_device({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Value::Null
            }
        });
        let power = Power::new(outbound, EventTarget::new());

        // A null result is still an acknowledgement.
        power.set_power(PowerState::Off).await.unwrap();
        assert_eq!(power.state(), Some(PowerState::Off));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_power_update() {
        let (outbound, requests) = fake_device(|_| json!(["on"]));
        let events = EventTarget::new();
        let mut sub = events.subscribe().unwrap();
        let power = Power::new(outbound, events);
        assert_eq!(power.state(), None);

        power.update().await.unwrap();
        assert_eq!(power.state(), Some(PowerState::On));
        assert!(matches!(sub.recv().await, Some(Event::UpdatePower(PowerState::On))));
        assert_eq!(requests.lock()[0].params, vec![json!("power")]);

        power.update().await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_power_update_rejects_garbage() {
        let (outbound, _) = fake_device(|_| json!(["dim"]));
        let power = Power::new(outbound, EventTarget::new());
        assert!(matches!(power.update().await, Err(Error::Format(_))));
        assert_eq!(power.state(), None);
    }

    #[test]
    fn test_power_state_parse() {
        assert_eq!("on".parse::<PowerState>().unwrap(), PowerState::On);
        assert_eq!(PowerState::Off.to_string(), "off");
        assert!("maybe".parse::<PowerState>().is_err());
    }
}
