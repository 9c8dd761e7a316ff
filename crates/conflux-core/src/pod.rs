//! Self-describing typed param objects.
//!
//! An [`Object`] is a typed bag of [`Property`] values keyed by small integer ids.
//! Values may be fixed or a [`Choice`] (range, step, enum, flags) whose first entry
//! is the default. The same representation is used for local negotiation and on
//! the wire, where it is serialized with serde.
//!
//! [`filter`] intersects an object with a filter object the way format
//! negotiation needs: each shared property is narrowed to the common subset and
//! the whole object is rejected as soon as one property has no overlap.

use crate::param::ParamId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Property keys, grouped by object type.
pub mod key {
    pub mod format {
        pub const MEDIA_TYPE: u32 = 1;
        pub const MEDIA_SUBTYPE: u32 = 2;
        pub const AUDIO_FORMAT: u32 = 0x10001;
        pub const AUDIO_FLAGS: u32 = 0x10002;
        pub const AUDIO_RATE: u32 = 0x10003;
        pub const AUDIO_CHANNELS: u32 = 0x10004;
        pub const AUDIO_POSITION: u32 = 0x10005;
    }

    pub mod buffers {
        pub const BUFFERS: u32 = 1;
        pub const BLOCKS: u32 = 2;
        pub const SIZE: u32 = 3;
        pub const STRIDE: u32 = 4;
        pub const ALIGN: u32 = 5;
        pub const DATA_TYPE: u32 = 6;
    }

    pub mod meta {
        pub const TYPE: u32 = 1;
        pub const SIZE: u32 = 2;
    }

    pub mod io {
        pub const ID: u32 = 1;
        pub const SIZE: u32 = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Format,
    ParamBuffers,
    ParamMeta,
    ParamIo,
    Props,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChoiceKind {
    None,
    /// `[default, min, max]`
    Range,
    /// `[default, min, max, step]`
    Step,
    /// `[default, alternatives...]`
    Enum,
    /// `[default, flags...]`
    Flags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub kind: ChoiceKind,
    pub values: Vec<Value>,
}

static NONE: Value = Value::None;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Id(u32),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Choice(Choice),
    Object(Object),
}

impl Value {
    pub fn range_int(default: i32, min: i32, max: i32) -> Self {
        Value::Choice(Choice {
            kind: ChoiceKind::Range,
            values: vec![Value::Int(default), Value::Int(min), Value::Int(max)],
        })
    }

    pub fn step_int(default: i32, min: i32, max: i32, step: i32) -> Self {
        Value::Choice(Choice {
            kind: ChoiceKind::Step,
            values: vec![
                Value::Int(default),
                Value::Int(min),
                Value::Int(max),
                Value::Int(step),
            ],
        })
    }

    pub fn enum_id(default: u32, alternatives: impl IntoIterator<Item = u32>) -> Self {
        let mut values = vec![Value::Id(default)];
        values.extend(alternatives.into_iter().map(Value::Id));
        Value::Choice(Choice {
            kind: ChoiceKind::Enum,
            values,
        })
    }

    pub fn enum_int(default: i32, alternatives: impl IntoIterator<Item = i32>) -> Self {
        let mut values = vec![Value::Int(default)];
        values.extend(alternatives.into_iter().map(Value::Int));
        Value::Choice(Choice {
            kind: ChoiceKind::Enum,
            values,
        })
    }

    /// A fixed value, or a choice that degenerates to one.
    pub fn fixed(&self) -> Option<&Value> {
        match self {
            Value::Choice(c) if c.kind == ChoiceKind::None => c.values.first(),
            Value::Choice(_) => None,
            v => Some(v),
        }
    }

    /// The default of a choice, or the value itself.
    pub fn default_value(&self) -> &Value {
        match self {
            Value::Choice(c) => c.values.first().unwrap_or(&NONE),
            v => v,
        }
    }

    pub fn as_id(&self) -> Option<u32> {
        match self.fixed()? {
            Value::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.fixed()? {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.fixed()? {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.fixed()? {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, Value::Choice(c) if c.kind != ChoiceKind::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub key: u32,
    pub flags: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub object_type: ObjectType,
    pub id: ParamId,
    pub props: Vec<Property>,
}

impl Object {
    pub fn new(object_type: ObjectType, id: ParamId) -> Self {
        Self {
            object_type,
            id,
            props: Vec::new(),
        }
    }

    /// Builder-style [`Object::set`].
    pub fn with(mut self, key: u32, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: u32, value: Value) {
        match self.props.iter_mut().find(|p| p.key == key) {
            Some(p) => p.value = value,
            None => self.props.push(Property {
                key,
                flags: 0,
                value,
            }),
        }
    }

    pub fn get(&self, key: u32) -> Option<&Value> {
        self.props.iter().find(|p| p.key == key).map(|p| &p.value)
    }

    /// Replaces every choice with its default.
    pub fn fixate(&mut self) {
        for prop in &mut self.props {
            let fixed = match &prop.value {
                Value::Choice(c) => c.values.first().cloned().unwrap_or(Value::None),
                Value::Object(o) => {
                    let mut o = o.clone();
                    o.fixate();
                    Value::Object(o)
                }
                _ => continue,
            };
            prop.value = fixed;
        }
    }

    pub fn fixated(&self) -> Object {
        let mut o = self.clone();
        o.fixate();
        o
    }

    pub fn is_fixed(&self) -> bool {
        self.props.iter().all(|p| !p.value.is_choice())
    }
}

/// Intersects `pod` with `filter`.
///
/// Returns `None` when the object types differ or any shared property has no
/// common value. Properties present on only one side are carried over unchanged.
pub fn filter(pod: &Object, filter: Option<&Object>) -> Option<Object> {
    let Some(filter) = filter else {
        return Some(pod.clone());
    };
    if pod.object_type != filter.object_type {
        return None;
    }

    let mut out = Object::new(pod.object_type, pod.id);
    for prop in &pod.props {
        let value = match filter.get(prop.key) {
            Some(fv) => intersect(&prop.value, fv)?,
            None => prop.value.clone(),
        };
        out.props.push(Property {
            key: prop.key,
            flags: prop.flags,
            value,
        });
    }
    for prop in &filter.props {
        if pod.get(prop.key).is_none() {
            out.props.push(prop.clone());
        }
    }
    Some(out)
}

enum Shape<'a> {
    Fixed(&'a Value),
    Range {
        default: &'a Value,
        min: &'a Value,
        max: &'a Value,
    },
    Enum {
        default: &'a Value,
        alternatives: &'a [Value],
    },
    Flags(&'a Value),
}

fn shape(value: &Value) -> Option<Shape<'_>> {
    let Value::Choice(choice) = value else {
        return Some(Shape::Fixed(value));
    };
    let values = &choice.values;
    match choice.kind {
        ChoiceKind::None => values.first().map(Shape::Fixed),
        ChoiceKind::Range | ChoiceKind::Step => match values.as_slice() {
            [default, min, max, ..] => Some(Shape::Range { default, min, max }),
            _ => None,
        },
        ChoiceKind::Enum => match values.split_first() {
            Some((default, [])) => Some(Shape::Enum {
                default,
                alternatives: std::slice::from_ref(default),
            }),
            Some((default, alternatives)) => Some(Shape::Enum {
                default,
                alternatives,
            }),
            None => None,
        },
        ChoiceKind::Flags => values.first().map(Shape::Flags),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.partial_cmp(y),
        (Value::Id(x), Value::Id(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Long(x), Value::Long(y)) => x.partial_cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => x.partial_cmp(y),
        _ => {
            if a == b {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    compare(a, b) == Some(Ordering::Equal)
}

fn within(v: &Value, min: &Value, max: &Value) -> bool {
    matches!(
        compare(v, min),
        Some(Ordering::Greater | Ordering::Equal)
    ) && matches!(compare(v, max), Some(Ordering::Less | Ordering::Equal))
}

fn enum_of(default: &Value, candidates: Vec<Value>) -> Option<Value> {
    let first = candidates.first()?.clone();
    if candidates.len() == 1 {
        return Some(first);
    }
    let default = if candidates.iter().any(|c| equal(c, default)) {
        default.clone()
    } else {
        first
    };
    let mut values = Vec::with_capacity(candidates.len() + 1);
    values.push(default);
    values.extend(candidates);
    Some(Value::Choice(Choice {
        kind: ChoiceKind::Enum,
        values,
    }))
}

fn flag_bits(v: &Value) -> Option<i64> {
    match v {
        Value::Int(x) => Some(i64::from(*x)),
        Value::Long(x) => Some(*x),
        Value::Id(x) => Some(i64::from(*x)),
        _ => None,
    }
}

/// Intersection of two property values.
pub fn intersect(a: &Value, b: &Value) -> Option<Value> {
    let (sa, sb) = (shape(a)?, shape(b)?);
    match (sa, sb) {
        (Shape::Fixed(x), Shape::Fixed(y)) => equal(x, y).then(|| x.clone()),

        (Shape::Fixed(x), Shape::Enum { alternatives, .. })
        | (Shape::Enum { alternatives, .. }, Shape::Fixed(x)) => {
            alternatives.iter().any(|alt| equal(alt, x)).then(|| x.clone())
        }

        (Shape::Fixed(x), Shape::Range { min, max, .. })
        | (Shape::Range { min, max, .. }, Shape::Fixed(x)) => {
            within(x, min, max).then(|| x.clone())
        }

        (
            Shape::Enum {
                default,
                alternatives: left,
            },
            Shape::Enum {
                alternatives: right,
                ..
            },
        ) => {
            let common = left
                .iter()
                .filter(|l| right.iter().any(|r| equal(l, r)))
                .cloned()
                .collect();
            enum_of(default, common)
        }

        (
            Shape::Enum {
                default,
                alternatives,
            },
            Shape::Range { min, max, .. },
        )
        | (
            Shape::Range { min, max, .. },
            Shape::Enum {
                default,
                alternatives,
            },
        ) => {
            let common = alternatives
                .iter()
                .filter(|v| within(v, min, max))
                .cloned()
                .collect();
            enum_of(default, common)
        }

        (
            Shape::Range {
                default,
                min: min1,
                max: max1,
            },
            Shape::Range {
                min: min2,
                max: max2,
                ..
            },
        ) => {
            let min = match compare(min1, min2)? {
                Ordering::Less => min2,
                _ => min1,
            };
            let max = match compare(max1, max2)? {
                Ordering::Greater => max2,
                _ => max1,
            };
            if compare(min, max)? == Ordering::Greater {
                return None;
            }
            if equal(min, max) {
                return Some(min.clone());
            }
            let default = if compare(default, min)? == Ordering::Less {
                min
            } else if compare(default, max)? == Ordering::Greater {
                max
            } else {
                default
            };
            Some(Value::Choice(Choice {
                kind: ChoiceKind::Range,
                values: vec![default.clone(), min.clone(), max.clone()],
            }))
        }

        (Shape::Flags(x), other) | (other, Shape::Flags(x)) => {
            let y = match other {
                Shape::Fixed(v) | Shape::Flags(v) => v,
                Shape::Range { default, .. } | Shape::Enum { default, .. } => default,
            };
            let bits = flag_bits(x)? & flag_bits(y)?;
            if bits == 0 {
                return None;
            }
            Some(match x {
                Value::Long(_) => Value::Long(bits),
                Value::Id(_) => Value::Id(bits as u32),
                _ => Value::Int(bits as i32),
            })
        }
    }
}
