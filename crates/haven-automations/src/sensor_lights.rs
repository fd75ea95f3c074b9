//! Sensors trigger lights
//!
//! Lights turn on when any sensor reports "on" and turn off a
//! configurable delay after the last sensor clears. Optionally the
//! lights dim ahead of the turn-off as a warning, and a manual change
//! to any of the lights opens an override window during which the
//! automation leaves them alone.
//!
//! State machine: Idle -> Active (sensor on) -> Countdown (all sensors
//! off, timer armed) -> Idle (timer fires) with HumanOverride layered
//! over the sensor transitions. Events caused by this automation never
//! reach it (the engine filters self-originated events), so any light
//! event it does receive is an external change by definition.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info};

use haven_engine::{
    Automation, Clock, EntityLike, LightLike, SystemClock, TimerCallback, TimerHandle,
};

type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

struct Scene {
    condition: Predicate,
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
struct AutoState {
    turn_off_timer: Option<TimerHandle>,
    dim_timer: Option<TimerHandle>,
    /// The brightness value this automation last commanded. Retriggers
    /// only reapply the configured brightness when the observed value
    /// still matches it, so a manually chosen level survives.
    last_commanded_brightness: Option<f64>,
    override_until: Option<DateTime<Utc>>,
}

impl AutoState {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.turn_off_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.dim_timer.take() {
            timer.cancel();
        }
    }

    fn override_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.override_until, Some(until) if now < until)
    }
}

pub struct SensorsTriggerLights {
    name: String,
    clock: Arc<dyn Clock>,
    sensors: Vec<Arc<dyn EntityLike>>,
    turn_on_lights: Vec<Arc<dyn LightLike>>,
    turn_off_lights: Vec<Arc<dyn LightLike>>,
    brightness: Option<f64>,
    turns_off_after: Option<Duration>,
    dim_before_turn_off: Option<Duration>,
    human_override_for: Option<Duration>,
    condition: Option<Predicate>,
    scenes: Vec<Scene>,
    state: Arc<Mutex<AutoState>>,
}

impl SensorsTriggerLights {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            clock: Arc::new(SystemClock),
            sensors: Vec::new(),
            turn_on_lights: Vec::new(),
            turn_off_lights: Vec::new(),
            brightness: None,
            turns_off_after: None,
            dim_before_turn_off: None,
            human_override_for: None,
            condition: None,
            scenes: Vec::new(),
            state: Arc::new(Mutex::new(AutoState::default())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn EntityLike>) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn with_sensors(mut self, sensors: Vec<Arc<dyn EntityLike>>) -> Self {
        self.sensors = sensors;
        self
    }

    /// Use the same lights for turn-on and turn-off
    pub fn with_light(mut self, light: Arc<dyn LightLike>) -> Self {
        self.turn_on_lights.push(light.clone());
        self.turn_off_lights.push(light);
        self
    }

    /// Use the same set for turn-on and turn-off
    pub fn with_lights(mut self, lights: Vec<Arc<dyn LightLike>>) -> Self {
        self.turn_on_lights = lights.clone();
        self.turn_off_lights = lights;
        self
    }

    pub fn with_turn_on_lights(mut self, lights: Vec<Arc<dyn LightLike>>) -> Self {
        self.turn_on_lights = lights;
        self
    }

    pub fn with_turn_off_lights(mut self, lights: Vec<Arc<dyn LightLike>>) -> Self {
        self.turn_off_lights = lights;
        self
    }

    /// Brightness applied on turn-on
    pub fn with_brightness(mut self, brightness: f64) -> Self {
        self.brightness = Some(brightness);
        self
    }

    /// Delay from the last sensor clearing to turn-off. Without it the
    /// sensors only ever turn lights on.
    pub fn turns_off_after(mut self, delay: Duration) -> Self {
        self.turns_off_after = Some(delay);
        self
    }

    /// Halve the brightness this long before the turn-off fires
    pub fn dim_lights_before_turn_off(mut self, window: Duration) -> Self {
        self.dim_before_turn_off = Some(window);
        self
    }

    /// After a manual change to one of the lights, leave them alone for
    /// this long
    pub fn with_human_override_for(mut self, window: Duration) -> Self {
        self.human_override_for = Some(window);
        self
    }

    /// Gate the whole automation on a predicate
    pub fn with_condition(mut self, condition: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    /// Add a conditional scene: on turn-on, the attributes of the last
    /// scene whose predicate holds are applied
    pub fn with_condition_scene(
        mut self,
        condition: impl Fn() -> bool + Send + Sync + 'static,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.scenes.push(Scene {
            condition: Box::new(condition),
            attributes,
        });
        self
    }

    /// True if any sensor currently reports "on"
    fn any_sensor_on(&self) -> bool {
        self.sensors.iter().any(|sensor| sensor.state().is_on())
    }

    fn light_ids(&self) -> HashSet<String> {
        self.turn_on_lights
            .iter()
            .chain(&self.turn_off_lights)
            .map(|light| light.id())
            .collect()
    }

    /// Attributes of the last scene whose predicate holds
    fn scene_attributes(&self) -> HashMap<String, serde_json::Value> {
        self.scenes
            .iter()
            .rev()
            .find(|scene| (scene.condition)())
            .map(|scene| scene.attributes.clone())
            .unwrap_or_default()
    }

    /// A manual change to one of our lights. The engine already filters
    /// events we caused ourselves, so this is externally sourced: open
    /// (or extend) the override window and stop any armed countdown.
    fn on_light_changed(&self, entity_id: &str) {
        let Some(window) = self.human_override_for else {
            return;
        };

        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let mut state = self.state.lock().unwrap();
        state.cancel_timers();
        state.override_until = Some(self.clock.now() + window);
        info!(
            automation = %self.name,
            entity_id = %entity_id,
            "manual light change, suspending sensor control"
        );
    }

    async fn on_presence(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.cancel_timers();
            if state.override_active(self.clock.now()) {
                debug!(automation = %self.name, "human override active, not touching lights");
                return;
            }
        }

        info!(automation = %self.name, "sensor triggered, turning on lights");

        let base_attrs = self.scene_attributes();
        let last_commanded = self.state.lock().unwrap().last_commanded_brightness;
        let mut brightness_applied = false;

        for light in &self.turn_on_lights {
            let mut attrs = base_attrs.clone();
            if let Some(brightness) = self.brightness {
                if safe_to_reapply(light, last_commanded) {
                    attrs.insert("brightness".to_string(), json!(brightness));
                    brightness_applied = true;
                }
            }

            if let Err(err) = light.turn_on_with(attrs).await {
                error!(
                    automation = %self.name,
                    light = %light.id(),
                    error = %err,
                    "error turning on light"
                );
            }
        }

        if brightness_applied {
            self.state.lock().unwrap().last_commanded_brightness = self.brightness;
        }
    }

    async fn on_clear(&self) {
        let Some(turns_off_after) = self.turns_off_after else {
            return;
        };

        let dim_immediately = {
            let mut state = self.state.lock().unwrap();
            if state.override_active(self.clock.now()) {
                debug!(automation = %self.name, "human override active, skipping countdown");
                return;
            }

            info!(automation = %self.name, "sensors clear, starting turn-off countdown");
            state.cancel_timers();
            state.turn_off_timer = Some(
                self.clock
                    .after(turns_off_after, self.turn_off_callback()),
            );

            match self.dim_before_turn_off {
                // A dim window at least as long as the countdown means
                // the warning starts right now.
                Some(dim_before) if dim_before >= turns_off_after => true,
                Some(dim_before) => {
                    state.dim_timer = Some(
                        self.clock
                            .after(turns_off_after - dim_before, self.dim_callback()),
                    );
                    false
                }
                None => false,
            }
        };

        if dim_immediately {
            dim_lights(
                &self.name,
                &self.turn_on_lights,
                self.brightness,
                &self.state,
            )
            .await;
        }
    }

    fn turn_off_callback(&self) -> TimerCallback {
        let name = self.name.clone();
        let lights = self.turn_off_lights.clone();
        let state = self.state.clone();

        Box::new(move || {
            Box::pin(async move {
                info!(automation = %name, "countdown elapsed, turning off lights");
                for light in &lights {
                    if let Err(err) = light.turn_off().await {
                        error!(
                            automation = %name,
                            light = %light.id(),
                            error = %err,
                            "error turning off light"
                        );
                    }
                }

                let mut state = state.lock().unwrap();
                state.turn_off_timer = None;
                state.dim_timer = None;
            })
        })
    }

    fn dim_callback(&self) -> TimerCallback {
        let name = self.name.clone();
        let lights = self.turn_on_lights.clone();
        let brightness = self.brightness;
        let state = self.state.clone();

        Box::new(move || {
            Box::pin(async move {
                dim_lights(&name, &lights, brightness, &state).await;
            })
        })
    }
}

/// Only reapply the configured brightness when the light still sits at
/// the value we last commanded; a manually chosen level wins otherwise.
fn safe_to_reapply(light: &Arc<dyn LightLike>, last_commanded: Option<f64>) -> bool {
    match (last_commanded, light.brightness()) {
        (Some(commanded), Some(observed)) => observed == commanded,
        _ => true,
    }
}

/// Halve the brightness as a turn-off warning
async fn dim_lights(
    name: &str,
    lights: &[Arc<dyn LightLike>],
    configured: Option<f64>,
    state: &Mutex<AutoState>,
) {
    info!(automation = %name, "dimming lights ahead of turn-off");

    for light in lights {
        let Some(current) = configured.or_else(|| light.brightness()) else {
            continue;
        };
        let attrs = HashMap::from([("brightness".to_string(), json!(current / 2.0))]);
        if let Err(err) = light.turn_on_with(attrs).await {
            error!(
                automation = %name,
                light = %light.id(),
                error = %err,
                "error dimming light"
            );
        }
    }

    if let Some(brightness) = configured {
        state.lock().unwrap().last_commanded_brightness = Some(brightness / 2.0);
    }
}

impl Default for SensorsTriggerLights {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Automation for SensorsTriggerLights {
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Sensors always; the lights too when a human-override window is
    /// configured, since detecting manual changes requires seeing the
    /// lights' own events.
    fn triggers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.iter().map(|sensor| sensor.id()).collect();

        if self.human_override_for.is_some() {
            let mut seen: HashSet<String> = ids.iter().cloned().collect();
            for light in self.turn_on_lights.iter().chain(&self.turn_off_lights) {
                let id = light.id();
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        ids
    }

    async fn action(&self, trigger: Arc<dyn EntityLike>) {
        if let Some(condition) = &self.condition {
            if !condition() {
                debug!(automation = %self.name, "condition not met, skipping");
                return;
            }
        }

        let trigger_id = trigger.id();
        if self.light_ids().contains(&trigger_id) {
            self.on_light_changed(&trigger_id);
            return;
        }

        if self.any_sensor_on() {
            self.on_presence().await;
        } else {
            self.on_clear().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use haven_core::State;
    use haven_engine::{EngineResult, Entity, MockClock};

    /// Records service calls and applies them to a local state, like
    /// the upstream would
    struct FakeLight {
        id: String,
        state: Mutex<State>,
        services: Mutex<Vec<(String, Option<f64>)>>,
    }

    impl FakeLight {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                state: Mutex::new(State::new(id, "off")),
                services: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Option<f64>)> {
            self.services.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LightLike for FakeLight {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn is_on(&self) -> bool {
            self.state.lock().unwrap().is_on()
        }

        fn brightness(&self) -> Option<f64> {
            self.state.lock().unwrap().brightness()
        }

        async fn turn_on(&self) -> EngineResult<()> {
            self.turn_on_with(HashMap::new()).await
        }

        async fn turn_on_with(
            &self,
            attrs: HashMap<String, serde_json::Value>,
        ) -> EngineResult<()> {
            let brightness = attrs.get("brightness").and_then(|v| v.as_f64());
            self.services
                .lock()
                .unwrap()
                .push(("turn_on".to_string(), brightness));

            let mut state = self.state.lock().unwrap();
            state.state = "on".to_string();
            state.attributes.extend(attrs);
            Ok(())
        }

        async fn turn_off(&self) -> EngineResult<()> {
            self.services.lock().unwrap().push(("turn_off".to_string(), None));
            self.state.lock().unwrap().state = "off".to_string();
            Ok(())
        }
    }

    fn on_sensor(id: &str) -> Arc<Entity> {
        let sensor = Entity::new(id);
        sensor.set_state(State::new(id, "on"));
        sensor
    }

    fn off_sensor(id: &str) -> Arc<Entity> {
        let sensor = Entity::new(id);
        sensor.set_state(State::new(id, "off"));
        sensor
    }

    #[tokio::test]
    async fn condition_gates_the_automation() {
        let sensor = on_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_sensor(sensor.clone())
            .with_light(light.clone())
            .with_condition(|| false);

        automation.action(sensor).await;
        assert!(light.calls().is_empty());
    }

    #[tokio::test]
    async fn last_matching_scene_wins() {
        let sensor = on_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_sensor(sensor.clone())
            .with_light(light.clone())
            .with_condition_scene(|| true, HashMap::from([("color_temp".into(), json!(300))]))
            .with_condition_scene(|| false, HashMap::from([("color_temp".into(), json!(500))]))
            .with_condition_scene(|| true, HashMap::from([("color_temp".into(), json!(450))]));

        automation.action(sensor).await;

        assert_eq!(light.calls(), vec![("turn_on".to_string(), None)]);
        assert_eq!(light.state.lock().unwrap().attribute::<i64>("color_temp"), Some(450));
    }

    #[tokio::test]
    async fn no_sensors_on_means_countdown_not_turn_on() {
        let clock = MockClock::new();
        let active = on_sensor("sensor.one");
        let cleared = off_sensor("sensor.two");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_clock(Arc::new(clock.clone()))
            .with_sensor(cleared.clone())
            .with_sensor(active.clone())
            .with_light(light.clone())
            .turns_off_after(Duration::from_secs(1));

        // One sensor still on: presence, not a countdown.
        automation.action(cleared.clone()).await;
        assert_eq!(light.calls(), vec![("turn_on".to_string(), None)]);

        // All clear: countdown arms and fires.
        active.set_state(State::new("sensor.one", "off"));
        automation.action(active).await;
        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(light.calls().last().unwrap().0, "turn_off");
    }

    #[tokio::test]
    async fn retrigger_cancels_the_countdown() {
        let clock = MockClock::new();
        let sensor = on_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_clock(Arc::new(clock.clone()))
            .with_sensor(sensor.clone())
            .with_light(light.clone())
            .turns_off_after(Duration::from_secs(1));

        automation.action(sensor.clone()).await;

        sensor.set_state(State::new("sensor.hall", "off"));
        automation.action(sensor.clone()).await;

        sensor.set_state(State::new("sensor.hall", "on"));
        automation.action(sensor.clone()).await;

        clock.advance(Duration::from_secs(5)).await;
        assert!(
            !light.calls().iter().any(|(service, _)| service == "turn_off"),
            "cancelled countdown must not fire"
        );
        assert!(light.is_on());
    }

    #[tokio::test]
    async fn dim_window_longer_than_countdown_dims_immediately() {
        let clock = MockClock::new();
        let sensor = on_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_clock(Arc::new(clock.clone()))
            .with_sensor(sensor.clone())
            .with_light(light.clone())
            .with_brightness(100.0)
            .turns_off_after(Duration::from_secs(1))
            .dim_lights_before_turn_off(Duration::from_secs(5));

        automation.action(sensor.clone()).await;
        sensor.set_state(State::new("sensor.hall", "off"));
        automation.action(sensor.clone()).await;

        // The dim happened on countdown entry, without any clock
        // advance.
        assert_eq!(
            light.calls().last().unwrap(),
            &("turn_on".to_string(), Some(50.0))
        );

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(light.calls().last().unwrap().0, "turn_off");
    }

    #[tokio::test]
    async fn empty_light_sets_are_legal() {
        let clock = MockClock::new();
        let sensor = on_sensor("sensor.hall");

        let automation = SensorsTriggerLights::new()
            .with_clock(Arc::new(clock.clone()))
            .with_sensor(sensor.clone())
            .turns_off_after(Duration::from_secs(1));

        automation.action(sensor.clone()).await;
        sensor.set_state(State::new("sensor.hall", "off"));
        automation.action(sensor).await;
        clock.advance(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn no_turns_off_after_means_no_auto_off() {
        let clock = MockClock::new();
        let sensor = on_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let automation = SensorsTriggerLights::new()
            .with_clock(Arc::new(clock.clone()))
            .with_sensor(sensor.clone())
            .with_light(light.clone());

        automation.action(sensor.clone()).await;
        sensor.set_state(State::new("sensor.hall", "off"));
        automation.action(sensor).await;
        clock.advance(Duration::from_secs(60)).await;

        assert!(light.is_on(), "sensors only drive turn-on without a countdown");
    }

    #[tokio::test]
    async fn lights_subscribed_only_with_override_window() {
        let sensor = off_sensor("sensor.hall");
        let light = FakeLight::new("light.hall");

        let plain = SensorsTriggerLights::new()
            .with_sensor(sensor.clone())
            .with_light(light.clone());
        assert_eq!(plain.triggers(), vec!["sensor.hall"]);

        let with_override = SensorsTriggerLights::new()
            .with_sensor(sensor)
            .with_light(light)
            .with_human_override_for(Duration::from_secs(60));
        assert_eq!(with_override.triggers(), vec!["sensor.hall", "light.hall"]);
    }
}
