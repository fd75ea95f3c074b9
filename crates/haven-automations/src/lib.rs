//! Built-in automations
//!
//! The reference automation is `SensorsTriggerLights`: motion or
//! presence sensors drive a set of lights, with an optional turn-off
//! countdown, pre-off dimming, conditional scenes and a human-override
//! window.

mod sensor_lights;

pub use sensor_lights::SensorsTriggerLights;
