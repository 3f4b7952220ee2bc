//! Standard lab types exchanged with the hardware controller.
//!
//! Enum variants travel as their upper-case names and are matched
//! case-insensitively on the way in. [`register_lab_types`] installs every
//! entry the controller's methods declare, including the compound tags.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{MarshalError, Result};
use crate::registry::MarshalRegistry;
use crate::tag::TypeTag;

pub const MOUNT: TypeTag = TypeTag::from_static("Mount");
pub const AXIS: TypeTag = TypeTag::from_static("Axis");
pub const CRITICAL_POINT: TypeTag = TypeTag::from_static("CriticalPoint");
pub const OPTIONAL_CRITICAL_POINT: TypeTag = TypeTag::from_static("Option<CriticalPoint>");
pub const POINT: TypeTag = TypeTag::from_static("Point");
pub const MOUNT_STRING_MAP: TypeTag = TypeTag::from_static("Map<Mount, String>");
pub const MOUNT_OBJECT_MAP: TypeTag = TypeTag::from_static("Map<Mount, Object>");
pub const AXIS_BOOL_MAP: TypeTag = TypeTag::from_static("Map<Axis, bool>");
pub const AXIS_LIST: TypeTag = TypeTag::from_static("Vec<Axis>");

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Upper-case wire name.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = MarshalError;

            fn from_str(name: &str) -> Result<Self> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|variant| variant.name().eq_ignore_ascii_case(name))
                    .ok_or_else(|| MarshalError::UnknownVariant {
                        kind: $kind,
                        name: name.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

wire_enum!(
    /// Pipette mount on the gantry.
    Mount, "mount" {
        Left => "LEFT",
        Right => "RIGHT",
    }
);

wire_enum!(
    /// Motion axis.
    Axis, "axis" {
        X => "X",
        Y => "Y",
        Z => "Z",
        A => "A",
        B => "B",
        C => "C",
    }
);

wire_enum!(
    /// Reference point on the instrument that motion commands position.
    CriticalPoint, "critical point" {
        Nozzle => "NOZZLE",
        Tip => "TIP",
        XyCenter => "XY_CENTER",
        FrontNozzle => "FRONT_NOZZLE",
    }
);

/// Deck coordinate in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

fn invalid(tag: &TypeTag, message: impl Into<String>) -> MarshalError {
    MarshalError::InvalidWireValue {
        tag: tag.clone(),
        message: message.into(),
    }
}

fn parse_name<E: FromStr<Err = MarshalError>>(tag: &TypeTag, value: &Value) -> Result<E> {
    value
        .as_str()
        .ok_or_else(|| invalid(tag, format!("expected a name string, got {value}")))?
        .parse()
}

fn as_object<'a>(tag: &TypeTag, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| invalid(tag, format!("expected an object, got {value}")))
}

fn point_from_value(value: &Value) -> Result<Point> {
    let coords = value
        .as_array()
        .ok_or_else(|| invalid(&POINT, format!("expected [x, y, z], got {value}")))?;
    if coords.len() != 3 {
        return Err(invalid(
            &POINT,
            format!("expected 3 coordinates, got {}", coords.len()),
        ));
    }
    let mut xyz = [0.0f64; 3];
    for (slot, coord) in xyz.iter_mut().zip(coords) {
        *slot = coord
            .as_f64()
            .ok_or_else(|| invalid(&POINT, format!("coordinate {coord} is not a number")))?;
    }
    Ok(Point::new(xyz[0], xyz[1], xyz[2]))
}

fn point_to_value(point: &Point) -> Result<Value> {
    let coords = [point.x, point.y, point.z]
        .into_iter()
        .map(|coord| {
            serde_json::Number::from_f64(coord)
                .map(Value::Number)
                .ok_or_else(|| invalid(&POINT, format!("coordinate {coord} is not finite")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Array(coords))
}

/// Install the standard lab entries into `registry`.
pub fn register_lab_types(registry: &mut MarshalRegistry) -> Result<()> {
    registry.register::<Mount, _, _>(
        MOUNT,
        |mount| Ok(Value::from(mount.name())),
        |value| parse_name(&MOUNT, value),
    )?;
    registry.register::<Axis, _, _>(
        AXIS,
        |axis| Ok(Value::from(axis.name())),
        |value| parse_name(&AXIS, value),
    )?;
    registry.register::<CriticalPoint, _, _>(
        CRITICAL_POINT,
        |cp| Ok(Value::from(cp.name())),
        |value| parse_name(&CRITICAL_POINT, value),
    )?;
    registry.register::<Option<CriticalPoint>, _, _>(
        OPTIONAL_CRITICAL_POINT,
        |cp| Ok(cp.map_or(Value::Null, |cp| Value::from(cp.name()))),
        |value| match value {
            Value::Null => Ok(None),
            other => parse_name(&OPTIONAL_CRITICAL_POINT, other).map(Some),
        },
    )?;
    registry.register::<Point, _, _>(POINT, point_to_value, point_from_value)?;
    registry.register::<BTreeMap<Mount, String>, _, _>(
        MOUNT_STRING_MAP,
        |map| {
            Ok(Value::Object(
                map.iter()
                    .map(|(mount, val)| (mount.name().to_string(), Value::from(val.as_str())))
                    .collect(),
            ))
        },
        |value| {
            as_object(&MOUNT_STRING_MAP, value)?
                .iter()
                .map(|(key, val)| -> Result<(Mount, String)> {
                    let text = val
                        .as_str()
                        .ok_or_else(|| invalid(&MOUNT_STRING_MAP, format!("{key}: expected a string")))?;
                    Ok((key.parse::<Mount>()?, text.to_string()))
                })
                .collect()
        },
    )?;
    registry.register::<BTreeMap<Mount, Value>, _, _>(
        MOUNT_OBJECT_MAP,
        |map| {
            Ok(Value::Object(
                map.iter()
                    .map(|(mount, val)| (mount.name().to_string(), val.clone()))
                    .collect(),
            ))
        },
        |value| {
            as_object(&MOUNT_OBJECT_MAP, value)?
                .iter()
                .map(|(key, val)| -> Result<(Mount, Value)> { Ok((key.parse()?, val.clone())) })
                .collect()
        },
    )?;
    registry.register::<BTreeMap<Axis, bool>, _, _>(
        AXIS_BOOL_MAP,
        |map| {
            Ok(Value::Object(
                map.iter()
                    .map(|(axis, engaged)| (axis.name().to_string(), Value::Bool(*engaged)))
                    .collect(),
            ))
        },
        |value| {
            as_object(&AXIS_BOOL_MAP, value)?
                .iter()
                .map(|(key, val)| -> Result<(Axis, bool)> {
                    let engaged = val
                        .as_bool()
                        .ok_or_else(|| invalid(&AXIS_BOOL_MAP, format!("{key}: expected a bool")))?;
                    Ok((key.parse::<Axis>()?, engaged))
                })
                .collect()
        },
    )?;
    registry.register::<Vec<Axis>, _, _>(
        AXIS_LIST,
        |axes| Ok(Value::Array(axes.iter().map(|axis| Value::from(axis.name())).collect())),
        |value| {
            value
                .as_array()
                .ok_or_else(|| invalid(&AXIS_LIST, format!("expected a list, got {value}")))?
                .iter()
                .map(|item| parse_name(&AXIS_LIST, item))
                .collect()
        },
    )?;
    Ok(())
}

/// A fresh registry holding the standard lab entries.
pub fn standard_registry() -> Result<MarshalRegistry> {
    let mut registry = MarshalRegistry::new();
    register_lab_types(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn enum_names_are_upper_case_on_the_wire() {
        let registry = standard_registry().unwrap();
        assert_eq!(registry.serialize_as("Mount", &Mount::Left).unwrap(), json!("LEFT"));
        assert_eq!(
            registry
                .serialize_as("CriticalPoint", &CriticalPoint::XyCenter)
                .unwrap(),
            json!("XY_CENTER")
        );
    }

    #[test]
    fn enum_names_match_case_insensitively() {
        let registry = standard_registry().unwrap();
        assert_eq!(
            registry.deserialize_as::<Mount>("Mount", &json!("right")).unwrap(),
            Mount::Right
        );
        assert_eq!(
            registry.deserialize_as::<Axis>("Axis", &json!("z")).unwrap(),
            Axis::Z
        );
        assert_eq!(
            registry
                .deserialize_as::<CriticalPoint>("CriticalPoint", &json!("front_nozzle"))
                .unwrap(),
            CriticalPoint::FrontNozzle
        );
    }

    #[test]
    fn unknown_enum_name_is_rejected() {
        let registry = standard_registry().unwrap();
        let result = registry.deserialize_as::<Mount>("Mount", &json!("middle"));
        assert!(matches!(result, Err(MarshalError::UnknownVariant { kind: "mount", .. })));
    }

    #[test]
    fn optional_critical_point_maps_null() {
        let registry = standard_registry().unwrap();
        assert_eq!(
            registry
                .serialize_as("Option<CriticalPoint>", &None::<CriticalPoint>)
                .unwrap(),
            Value::Null
        );
        assert_eq!(
            registry
                .deserialize_as::<Option<CriticalPoint>>("Option<CriticalPoint>", &json!("tip"))
                .unwrap(),
            Some(CriticalPoint::Tip)
        );
        assert_eq!(
            registry
                .deserialize_as::<Option<CriticalPoint>>("Option<CriticalPoint>", &Value::Null)
                .unwrap(),
            None
        );
    }

    #[test]
    fn point_is_a_three_element_array() {
        let registry = standard_registry().unwrap();
        assert_eq!(
            registry.serialize_as("Point", &Point::new(1.0, 2.5, -3.0)).unwrap(),
            json!([1.0, 2.5, -3.0])
        );
        assert_eq!(
            registry.deserialize_as::<Point>("Point", &json!([10, 20, 30])).unwrap(),
            Point::new(10.0, 20.0, 30.0)
        );
        assert!(registry.deserialize_as::<Point>("Point", &json!([1, 2])).is_err());
        assert!(registry.deserialize_as::<Point>("Point", &json!([1, "y", 3])).is_err());
    }

    #[test]
    fn compound_maps_use_enum_names_as_keys() {
        let registry = standard_registry().unwrap();

        let engaged = registry
            .deserialize_as::<BTreeMap<Axis, bool>>("Map<Axis, bool>", &json!({"x": true, "A": false}))
            .unwrap();
        assert_eq!(engaged.get(&Axis::X), Some(&true));
        assert_eq!(engaged.get(&Axis::A), Some(&false));

        let mut models = BTreeMap::new();
        models.insert(Mount::Left, "p300_single_v2.0".to_string());
        assert_eq!(
            registry.serialize_as("Map<Mount, String>", &models).unwrap(),
            json!({"LEFT": "p300_single_v2.0"})
        );

        let pipettes = registry
            .deserialize_as::<BTreeMap<Mount, Value>>(
                "Map<Mount, Object>",
                &json!({"right": {"model": "p20_multi_v2.1"}}),
            )
            .unwrap();
        assert_eq!(pipettes[&Mount::Right]["model"], "p20_multi_v2.1");
    }

    #[test]
    fn axis_list_round_trips_through_names() {
        let registry = standard_registry().unwrap();
        let axes = registry
            .deserialize_as::<Vec<Axis>>("Vec<Axis>", &json!(["X", "y", "Z"]))
            .unwrap();
        assert_eq!(axes, vec![Axis::X, Axis::Y, Axis::Z]);
        assert_eq!(
            registry.serialize_as("Vec<Axis>", &axes).unwrap(),
            json!(["X", "Y", "Z"])
        );
    }

    #[test]
    fn compound_tags_are_independent_of_element_tags() {
        let mut registry = MarshalRegistry::new();
        registry
            .register::<Mount, _, _>(MOUNT, |m| Ok(Value::from(m.name())), |v| parse_name(&MOUNT, v))
            .unwrap();
        assert!(!registry.has_entry("Map<Mount, String>"));
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = standard_registry().unwrap();
        assert!(matches!(
            register_lab_types(&mut registry),
            Err(MarshalError::DuplicateEntry(_))
        ));
    }
}
