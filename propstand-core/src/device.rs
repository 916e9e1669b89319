//! Device CONFIG model
//!
//! A device introduces itself with a JSON document carried in its first
//! packet. The schema is deliberately light: the server requires only
//! `deviceName` and `deviceType`, plus a `units` per sensor and a
//! `defaultState` per control. Everything else in a descriptor (ADC
//! indices, pins, calibration constants) is retained verbatim so the
//! operator surface can show it without this crate understanding it.
//!
//! Sensor ids and command ids are positions in the tables built here, so
//! table order is part of the wire contract: sensor categories iterate
//! thermocouples, then pressure transducers, then load cells, and within a
//! category entries keep the JSON text order (the firmware emits them in
//! channel order).

use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::packet::ControlState;

/// Sensor categories, in sensor-id assignment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCategory {
    Thermocouple,
    PressureTransducer,
    LoadCell,
}

impl SensorCategory {
    pub const ALL: [SensorCategory; 3] = [
        SensorCategory::Thermocouple,
        SensorCategory::PressureTransducer,
        SensorCategory::LoadCell,
    ];

    /// Key under `sensorInfo` in the CONFIG JSON
    pub fn json_key(&self) -> &'static str {
        match self {
            SensorCategory::Thermocouple => "thermocouples",
            SensorCategory::PressureTransducer => "pressureTransducers",
            SensorCategory::LoadCell => "loadCells",
        }
    }
}

impl std::fmt::Display for SensorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            SensorCategory::Thermocouple => "thermocouple",
            SensorCategory::PressureTransducer => "pressure transducer",
            SensorCategory::LoadCell => "load cell",
        };
        write!(f, "{}", name)
    }
}

/// One sensor as declared by the device. Its position in
/// [`DeviceConfig::sensors`] is the `sensor_id` used in DATA packets.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDef {
    pub name: String,
    pub category: SensorCategory,
    /// Unit label as the device spells it ("C", "PSI", "N", ...)
    pub units: String,
    /// Full descriptor object, retained verbatim
    pub descriptor: Map<String, Value>,
}

/// One control as declared by the device. Its position in
/// [`DeviceConfig::controls`] is the `cmd_id` used in CONTROL packets.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDef {
    pub name: String,
    pub pin: Option<i64>,
    pub kind: Option<String>,
    /// State the control falls back to on ESTOP
    pub default_state: ControlState,
    /// Full descriptor object, retained verbatim
    pub descriptor: Map<String, Value>,
}

/// Parsed and validated device configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: String,
    pub sensors: Vec<SensorDef>,
    pub controls: Vec<ControlDef>,
}

impl DeviceConfig {
    /// Parse the CONFIG JSON payload.
    ///
    /// Fails if the document is not a JSON object with string `deviceName`
    /// and `deviceType`, if a sensor lacks a string `units`, or if a
    /// control's `defaultState` is not `"OPEN"` or `"CLOSED"`. A failure
    /// here fails the handshake and the connection is dropped without an
    /// ACK.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        let root = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidConfig("not a JSON object".into()))?;

        let name = required_string(root, "deviceName")?;
        let kind = required_string(root, "deviceType")?;

        let mut sensors = Vec::new();
        if let Some(sensor_info) = root.get("sensorInfo") {
            let sensor_info = sensor_info.as_object().ok_or_else(|| {
                ProtocolError::InvalidConfig("sensorInfo is not an object".into())
            })?;
            for category in SensorCategory::ALL {
                let Some(group) = sensor_info.get(category.json_key()) else {
                    continue;
                };
                let group = group.as_object().ok_or_else(|| {
                    ProtocolError::InvalidConfig(format!(
                        "sensorInfo.{} is not an object",
                        category.json_key()
                    ))
                })?;
                for (sensor_name, descriptor) in group {
                    let descriptor = descriptor.as_object().cloned().ok_or_else(|| {
                        ProtocolError::InvalidConfig(format!(
                            "descriptor for sensor '{}' is not an object",
                            sensor_name
                        ))
                    })?;
                    let units = descriptor
                        .get("units")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ProtocolError::InvalidConfig(format!(
                                "sensor '{}' has no units",
                                sensor_name
                            ))
                        })?
                        .to_owned();
                    sensors.push(SensorDef {
                        name: sensor_name.clone(),
                        category,
                        units,
                        descriptor,
                    });
                }
            }
        }

        let mut controls = Vec::new();
        if let Some(control_map) = root.get("controls") {
            let control_map = control_map.as_object().ok_or_else(|| {
                ProtocolError::InvalidConfig("controls is not an object".into())
            })?;
            for (control_name, descriptor) in control_map {
                let descriptor = descriptor.as_object().cloned().ok_or_else(|| {
                    ProtocolError::InvalidConfig(format!(
                        "descriptor for control '{}' is not an object",
                        control_name
                    ))
                })?;
                let default_state = match descriptor.get("defaultState").and_then(Value::as_str) {
                    Some("OPEN") => ControlState::Open,
                    Some("CLOSED") => ControlState::Closed,
                    other => {
                        return Err(ProtocolError::InvalidConfig(format!(
                            "control '{}' has defaultState {:?}, expected OPEN or CLOSED",
                            control_name, other
                        )))
                    }
                };
                controls.push(ControlDef {
                    name: control_name.clone(),
                    pin: descriptor.get("pin").and_then(Value::as_i64),
                    kind: descriptor
                        .get("type")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    default_state,
                    descriptor,
                });
            }
        }

        Ok(DeviceConfig {
            name,
            kind,
            sensors,
            controls,
        })
    }

    /// Look up a control's `cmd_id` by name (case-insensitive, as the
    /// operator types it).
    pub fn control_id(&self, name: &str) -> Option<u8> {
        self.controls
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(|i| i as u8)
    }

    pub fn sensor(&self, sensor_id: u8) -> Option<&SensorDef> {
        self.sensors.get(sensor_id as usize)
    }

    pub fn control(&self, cmd_id: u8) -> Option<&ControlDef> {
        self.controls.get(cmd_id as usize)
    }
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Result<String, ProtocolError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::InvalidConfig(format!("missing string field '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOCK_CONFIG: &str = r#"{
        "deviceName": "GroundStand",
        "deviceType": "Sensor Monitor",
        "sensorInfo": {
            "pressureTransducers": {
                "PT1": {"ADCIndex": 2, "pin": 5, "maxPressure_PSI": 500, "units": "PSI"}
            },
            "thermocouples": {
                "TC1": {"ADCIndex": 0, "highPin": 1, "lowPin": 2, "type": "K", "units": "C"},
                "TC2": {"ADCIndex": 1, "highPin": 3, "lowPin": 4, "type": "K", "units": "C"}
            },
            "loadCells": {
                "LC1": {"ADCIndex": 3, "loadRating_N": 4448, "units": "N"}
            }
        },
        "controls": {
            "AVFILL": {"pin": 10, "type": "valve", "defaultState": "CLOSED"},
            "AVVENT": {"pin": 11, "type": "valve", "defaultState": "OPEN"}
        }
    }"#;

    #[test]
    fn test_category_order_fixes_sensor_ids() {
        let config = DeviceConfig::from_json(MOCK_CONFIG).unwrap();
        // Thermocouples come first even though the JSON lists transducers first
        let names: Vec<&str> = config.sensors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["TC1", "TC2", "PT1", "LC1"]);
        assert_eq!(config.sensors[0].category, SensorCategory::Thermocouple);
        assert_eq!(
            config.sensors[2].category,
            SensorCategory::PressureTransducer
        );
        assert_eq!(config.sensors[3].category, SensorCategory::LoadCell);
    }

    #[test]
    fn test_descriptor_retained_verbatim() {
        let config = DeviceConfig::from_json(MOCK_CONFIG).unwrap();
        let pt1 = &config.sensors[2];
        assert_eq!(pt1.units, "PSI");
        assert_eq!(
            pt1.descriptor.get("maxPressure_PSI"),
            Some(&Value::from(500))
        );
        assert_eq!(pt1.descriptor.get("ADCIndex"), Some(&Value::from(2)));
    }

    #[test]
    fn test_control_ids_and_defaults() {
        let config = DeviceConfig::from_json(MOCK_CONFIG).unwrap();
        assert_eq!(config.control_id("AVFILL"), Some(0));
        assert_eq!(config.control_id("avvent"), Some(1));
        assert_eq!(config.control_id("NONEXISTENT"), None);
        assert_eq!(config.controls[0].default_state, ControlState::Closed);
        assert_eq!(config.controls[1].default_state, ControlState::Open);
        assert_eq!(config.controls[0].pin, Some(10));
        assert_eq!(config.controls[0].kind.as_deref(), Some("valve"));
    }

    #[test]
    fn test_minimal_config_accepted() {
        let config =
            DeviceConfig::from_json(r#"{"deviceName":"D","deviceType":"Sensor Monitor"}"#)
                .unwrap();
        assert_eq!(config.name, "D");
        assert!(config.sensors.is_empty());
        assert!(config.controls.is_empty());
    }

    #[test]
    fn test_missing_device_name_rejected() {
        assert!(matches!(
            DeviceConfig::from_json(r#"{"deviceType":"Sensor Monitor"}"#),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            DeviceConfig::from_json(r#"[1,2,3]"#),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_sensor_without_units_rejected() {
        let json = r#"{
            "deviceName": "D",
            "deviceType": "Sensor Monitor",
            "sensorInfo": {"thermocouples": {"TC1": {"ADCIndex": 0}}}
        }"#;
        assert!(matches!(
            DeviceConfig::from_json(json),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_default_state_rejected() {
        let json = r#"{
            "deviceName": "D",
            "deviceType": "Sensor Monitor",
            "controls": {"AVFILL": {"pin": 10, "defaultState": "AJAR"}}
        }"#;
        assert!(matches!(
            DeviceConfig::from_json(json),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }
}
