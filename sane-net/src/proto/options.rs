//! Option descriptors, option values, device records and scan parameters,
//! together with their wire encodings.

use tokio::io::AsyncRead;

use crate::proto::{Cap, Frame, Unit, ValueType};
use crate::wire::{WireError, WireReader, WireWriter};

/// Inclusive value range with optional quantization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: i32,
    pub max: i32,
    pub quant: i32,
}

/// Constraint on the values an option accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Constraint {
    #[default]
    None,
    Range(Range),
    WordList(Vec<i32>),
    StringList(Vec<String>),
}

impl Constraint {
    fn tag(&self) -> i32 {
        match self {
            Constraint::None => 0,
            Constraint::Range(_) => 1,
            Constraint::WordList(_) => 2,
            Constraint::StringList(_) => 3,
        }
    }
}

/// Description of one configurable knob of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ty: ValueType,
    pub unit: Unit,
    /// Bytes of value storage; for strings the maximum length including
    /// the terminator, for word arrays `n * 4`.
    pub size: i32,
    pub cap: Cap,
    pub constraint: Constraint,
}

impl OptionDescriptor {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_string(self.name.as_deref());
        w.put_string(self.title.as_deref());
        w.put_string(self.description.as_deref());
        w.put_word(self.ty.to_word());
        w.put_word(self.unit.to_word());
        w.put_word(self.size);
        w.put_word(self.cap.bits());
        w.put_word(self.constraint.tag());
        match &self.constraint {
            Constraint::None => {}
            Constraint::Range(r) => {
                w.put_ptr_flag(true);
                w.put_word(r.min);
                w.put_word(r.max);
                w.put_word(r.quant);
            }
            // Word lists keep the legacy layout where element 0 repeats
            // the count.
            Constraint::WordList(words) => {
                w.put_word(words.len() as i32 + 1);
                w.put_word(words.len() as i32);
                for v in words {
                    w.put_word(*v);
                }
            }
            // String lists carry a trailing null string.
            Constraint::StringList(strings) => {
                w.put_word(strings.len() as i32 + 1);
                for s in strings {
                    w.put_string(Some(s));
                }
                w.put_string(None);
            }
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(
        r: &mut WireReader<R>,
    ) -> Result<Self, WireError> {
        let name = r.read_string().await?;
        let title = r.read_string().await?;
        let description = r.read_string().await?;
        let ty = ValueType::from_word(r.read_word().await?)?;
        let unit = Unit::from_word(r.read_word().await?)?;
        let size = r.read_word().await?;
        let cap = Cap::from_bits_truncate(r.read_word().await?);
        let constraint = match r.read_word().await? {
            0 => Constraint::None,
            1 => {
                if r.read_ptr_flag().await? {
                    Constraint::Range(Range {
                        min: r.read_word().await?,
                        max: r.read_word().await?,
                        quant: r.read_word().await?,
                    })
                } else {
                    Constraint::None
                }
            }
            2 => {
                let n = r.read_len(4).await?;
                let mut words = Vec::with_capacity(n);
                for _ in 0..n {
                    words.push(r.read_word().await?);
                }
                // Drop the redundant leading count.
                if !words.is_empty() {
                    words.remove(0);
                }
                Constraint::WordList(words)
            }
            3 => {
                let n = r.read_len(4).await?;
                let mut strings = Vec::with_capacity(n);
                for _ in 0..n {
                    if let Some(s) = r.read_string().await? {
                        strings.push(s);
                    }
                }
                Constraint::StringList(strings)
            }
            other => return Err(WireError::bad("constraint type", other as i64)),
        };
        Ok(OptionDescriptor { name, title, description, ty, unit, size, cap, constraint })
    }
}

/// Current value of an option, shaped by the descriptor's value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Payload of bool, int and fixed options; arrays carry one word per
    /// element.
    Words(Vec<i32>),
    /// Payload of string options; `None` is the null string.
    Text(Option<String>),
    /// Buttons and groups carry no value.
    Empty,
}

impl OptionValue {
    /// Bytes of storage the value occupies, as carried in `value_size`.
    pub fn size(&self) -> i32 {
        match self {
            OptionValue::Words(words) => words.len() as i32 * 4,
            OptionValue::Text(Some(s)) => s.len() as i32 + 1,
            OptionValue::Text(None) => 0,
            OptionValue::Empty => 0,
        }
    }

    pub fn write<W>(&self, w: &mut WireWriter<W>, ty: ValueType) {
        match ty {
            ValueType::Bool | ValueType::Int | ValueType::Fixed => {
                let words: &[i32] = match self {
                    OptionValue::Words(words) => words,
                    _ => &[],
                };
                w.put_word(words.len() as i32);
                for v in words {
                    w.put_word(*v);
                }
            }
            ValueType::String => {
                let text = match self {
                    OptionValue::Text(text) => text.as_deref(),
                    _ => None,
                };
                w.put_string(text);
            }
            ValueType::Button | ValueType::Group => {}
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(
        r: &mut WireReader<R>,
        ty: ValueType,
    ) -> Result<Self, WireError> {
        Ok(match ty {
            ValueType::Bool | ValueType::Int | ValueType::Fixed => {
                let n = r.read_len(4).await?;
                let mut words = Vec::with_capacity(n);
                for _ in 0..n {
                    words.push(r.read_word().await?);
                }
                OptionValue::Words(words)
            }
            ValueType::String => OptionValue::Text(r.read_string().await?),
            ValueType::Button | ValueType::Group => OptionValue::Empty,
        })
    }
}

/// One entry of the device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Opaque handle passed to `open`.
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub kind: String,
}

impl DeviceInfo {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_string(Some(&self.name));
        w.put_string(Some(&self.vendor));
        w.put_string(Some(&self.model));
        w.put_string(Some(&self.kind));
    }

    pub async fn read<R: AsyncRead + Unpin>(
        r: &mut WireReader<R>,
    ) -> Result<Self, WireError> {
        Ok(DeviceInfo {
            name: r.read_string().await?.unwrap_or_default(),
            vendor: r.read_string().await?.unwrap_or_default(),
            model: r.read_string().await?.unwrap_or_default(),
            kind: r.read_string().await?.unwrap_or_default(),
        })
    }
}

/// Geometry of the frame a scan will produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub format: Frame,
    pub last_frame: bool,
    pub bytes_per_line: i32,
    pub pixels_per_line: i32,
    /// Number of lines, or -1 when not known in advance.
    pub lines: i32,
    /// Bits per sample: 1, 8 or 16.
    pub depth: i32,
}

impl Parameters {
    pub fn write<W>(&self, w: &mut WireWriter<W>) {
        w.put_word(self.format.to_word());
        w.put_bool(self.last_frame);
        w.put_word(self.bytes_per_line);
        w.put_word(self.pixels_per_line);
        w.put_word(self.lines);
        w.put_word(self.depth);
    }

    pub async fn read<R: AsyncRead + Unpin>(
        r: &mut WireReader<R>,
    ) -> Result<Self, WireError> {
        Ok(Parameters {
            format: Frame::from_word(r.read_word().await?)?,
            last_frame: r.read_bool().await?,
            bytes_per_line: r.read_word().await?,
            pixels_per_line: r.read_word().await?,
            lines: r.read_word().await?,
            depth: r.read_word().await?,
        })
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            format: Frame::Gray,
            last_frame: true,
            bytes_per_line: 0,
            pixels_per_line: 0,
            lines: 0,
            depth: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip_descriptor(desc: &OptionDescriptor) -> OptionDescriptor {
        let mut w = WireWriter::new(Vec::new());
        desc.write(&mut w);
        w.flush().await.unwrap();
        let bytes = w.into_inner();
        let mut r = WireReader::new(bytes.as_slice());
        OptionDescriptor::read(&mut r).await.unwrap()
    }

    #[tokio::test]
    async fn descriptor_with_range_round_trips() {
        let desc = OptionDescriptor {
            name: Some("resolution".into()),
            title: Some("Scan resolution".into()),
            description: Some("Resolution in dots per inch".into()),
            ty: ValueType::Int,
            unit: Unit::Dpi,
            size: 4,
            cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
            constraint: Constraint::Range(Range { min: 75, max: 1200, quant: 25 }),
        };
        assert_eq!(round_trip_descriptor(&desc).await, desc);
    }

    #[tokio::test]
    async fn descriptor_with_word_list_keeps_legacy_count_element() {
        let desc = OptionDescriptor {
            name: Some("depth".into()),
            title: None,
            description: None,
            ty: ValueType::Int,
            unit: Unit::Bit,
            size: 4,
            cap: Cap::SOFT_SELECT,
            constraint: Constraint::WordList(vec![1, 8, 16]),
        };
        let mut w = WireWriter::new(Vec::new());
        desc.write(&mut w);
        w.flush().await.unwrap();
        let bytes = w.into_inner();
        // tag, array length 4, then count 3 followed by the values
        let tail = &bytes[bytes.len() - 24..];
        assert_eq!(
            tail,
            [0, 0, 0, 2, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 8, 0, 0, 0, 16]
        );
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(OptionDescriptor::read(&mut r).await.unwrap(), desc);
    }

    #[tokio::test]
    async fn descriptor_with_string_list_round_trips() {
        let desc = OptionDescriptor {
            name: Some("mode".into()),
            title: Some("Scan mode".into()),
            description: None,
            ty: ValueType::String,
            unit: Unit::None,
            size: 16,
            cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
            constraint: Constraint::StringList(vec!["Gray".into(), "Color".into()]),
        };
        assert_eq!(round_trip_descriptor(&desc).await, desc);
    }

    #[tokio::test]
    async fn word_value_encodes_as_counted_array() {
        let value = OptionValue::Words(vec![300]);
        let mut w = WireWriter::new(Vec::new());
        value.write(&mut w, ValueType::Int);
        w.flush().await.unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes, [0, 0, 0, 1, 0, 0, 1, 44]);
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(OptionValue::read(&mut r, ValueType::Int).await.unwrap(), value);
    }

    #[tokio::test]
    async fn button_value_occupies_no_bytes() {
        let mut w = WireWriter::new(Vec::new());
        OptionValue::Empty.write(&mut w, ValueType::Button);
        w.flush().await.unwrap();
        assert!(w.into_inner().is_empty());
    }

    #[tokio::test]
    async fn parameters_round_trip() {
        let params = Parameters {
            format: Frame::Rgb,
            last_frame: true,
            bytes_per_line: 1920,
            pixels_per_line: 640,
            lines: -1,
            depth: 16,
        };
        let mut w = WireWriter::new(Vec::new());
        params.write(&mut w);
        w.flush().await.unwrap();
        let bytes = w.into_inner();
        let mut r = WireReader::new(bytes.as_slice());
        assert_eq!(Parameters::read(&mut r).await.unwrap(), params);
    }
}
