//! Raw audio sample encodings and negotiated audio format info.

use crate::error::{Error, Result};
use crate::param::ParamId;
use crate::pod::{key, Object, ObjectType, Value};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_AUDIO: u32 = 1;
pub const MEDIA_SUBTYPE_RAW: u32 = 1;
pub const MEDIA_SUBTYPE_DSP: u32 = 2;

/// Sample encodings handled by the mixing kernels.
///
/// Multi-byte integer encodings are native-endian. `S24` and `U24` are packed
/// three-byte samples; `S24_32` and `U24_32` keep 24 significant bits in a
/// 32-bit container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum SampleFormat {
    Unknown,
    S8,
    U8,
    S16,
    U16,
    S24,
    U24,
    S32,
    U32,
    S24_32,
    U24_32,
    F32,
    F64,
    F32P,
    F64P,
}

impl SampleFormat {
    /// The interleaved encodings advertised by the mixer.
    pub const INTERLEAVED: [SampleFormat; 12] = [
        SampleFormat::S8,
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::U16,
        SampleFormat::S24,
        SampleFormat::U24,
        SampleFormat::S32,
        SampleFormat::U32,
        SampleFormat::S24_32,
        SampleFormat::U24_32,
        SampleFormat::F32,
        SampleFormat::F64,
    ];

    /// Bytes per sample.
    pub const fn width(self) -> usize {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => 1,
            SampleFormat::S16 | SampleFormat::U16 => 2,
            SampleFormat::S24 | SampleFormat::U24 => 3,
            SampleFormat::F64 | SampleFormat::F64P => 8,
            _ => 4,
        }
    }

    pub const fn is_planar(self) -> bool {
        matches!(self, SampleFormat::F32P | SampleFormat::F64P)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            SampleFormat::U8 | SampleFormat::U16 | SampleFormat::U24 | SampleFormat::U32 | SampleFormat::U24_32
        )
    }

    /// Whether all-zero bytes encode silence.
    pub const fn has_silence(self) -> bool {
        !self.is_unsigned() && !matches!(self, SampleFormat::Unknown)
    }

    pub const fn id(self) -> u32 {
        match self {
            SampleFormat::Unknown => 0,
            SampleFormat::S8 => 0x101,
            SampleFormat::U8 => 0x102,
            SampleFormat::S16 => 0x103,
            SampleFormat::U16 => 0x105,
            SampleFormat::S24_32 => 0x107,
            SampleFormat::U24_32 => 0x109,
            SampleFormat::S32 => 0x10b,
            SampleFormat::U32 => 0x10d,
            SampleFormat::S24 => 0x10f,
            SampleFormat::U24 => 0x111,
            SampleFormat::F32 => 0x11b,
            SampleFormat::F64 => 0x11d,
            SampleFormat::F32P => 0x206,
            SampleFormat::F64P => 0x207,
        }
    }

    pub fn from_id(id: u32) -> Self {
        [
            SampleFormat::S8,
            SampleFormat::U8,
            SampleFormat::S16,
            SampleFormat::U16,
            SampleFormat::S24,
            SampleFormat::U24,
            SampleFormat::S32,
            SampleFormat::U32,
            SampleFormat::S24_32,
            SampleFormat::U24_32,
            SampleFormat::F32,
            SampleFormat::F64,
            SampleFormat::F32P,
            SampleFormat::F64P,
        ]
        .into_iter()
        .find(|f| f.id() == id)
        .unwrap_or(SampleFormat::Unknown)
    }
}

/// A negotiated raw or DSP audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub subtype: u32,
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

impl AudioInfo {
    pub fn raw(format: SampleFormat, rate: u32, channels: u32) -> Self {
        Self {
            subtype: MEDIA_SUBTYPE_RAW,
            format,
            rate,
            channels,
        }
    }

    /// Mono planar float, the DSP port format.
    pub fn dsp(rate: u32) -> Self {
        Self {
            subtype: MEDIA_SUBTYPE_DSP,
            format: SampleFormat::F32P,
            rate,
            channels: 1,
        }
    }

    /// Parses a fixed format object. Missing rate or channels are reported as 0.
    pub fn parse(obj: &Object) -> Result<Self> {
        if obj.object_type != ObjectType::Format {
            return Err(Error::InvalidFormat("not a format object".into()));
        }
        let media_type = obj.get(key::format::MEDIA_TYPE).and_then(Value::as_id);
        if media_type != Some(MEDIA_TYPE_AUDIO) {
            return Err(Error::InvalidFormat(format!(
                "media type {:?} is not audio",
                media_type
            )));
        }
        let subtype = obj
            .get(key::format::MEDIA_SUBTYPE)
            .and_then(Value::as_id)
            .ok_or_else(|| Error::InvalidFormat("missing media subtype".into()))?;

        let format = match obj.get(key::format::AUDIO_FORMAT) {
            Some(v) => SampleFormat::from_id(
                v.as_id()
                    .ok_or_else(|| Error::InvalidFormat("audio format is not fixed".into()))?,
            ),
            None => SampleFormat::Unknown,
        };
        let int = |k: u32, name: &str| -> Result<u32> {
            match obj.get(k) {
                None => Ok(0),
                Some(v) => v
                    .as_int()
                    .and_then(|i| u32::try_from(i).ok())
                    .ok_or_else(|| Error::InvalidFormat(format!("{} is not a fixed integer", name))),
            }
        };

        Ok(Self {
            subtype,
            format,
            rate: int(key::format::AUDIO_RATE, "rate")?,
            channels: int(key::format::AUDIO_CHANNELS, "channels")?,
        })
    }

    /// Builds the fixed format object for this info.
    pub fn to_object(&self, id: ParamId) -> Object {
        let mut obj = Object::new(ObjectType::Format, id)
            .with(key::format::MEDIA_TYPE, Value::Id(MEDIA_TYPE_AUDIO))
            .with(key::format::MEDIA_SUBTYPE, Value::Id(self.subtype))
            .with(key::format::AUDIO_FORMAT, Value::Id(self.format.id()));
        if self.rate != 0 {
            obj.set(key::format::AUDIO_RATE, Value::Int(self.rate as i32));
        }
        if self.channels != 0 {
            obj.set(key::format::AUDIO_CHANNELS, Value::Int(self.channels as i32));
        }
        obj
    }

    /// Bytes per frame on one data plane.
    pub fn stride(&self) -> u32 {
        let width = self.format.width() as u32;
        if self.format.is_planar() {
            width
        } else {
            width * self.channels
        }
    }

    /// Number of data planes per buffer.
    pub fn blocks(&self) -> u32 {
        if self.format.is_planar() {
            self.channels
        } else {
            1
        }
    }
}
