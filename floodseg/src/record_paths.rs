//! Parameter listing of a module record, keyed by field path.
//!
//! A record item is walked through its `Serialize` implementation. Struct fields, sequence
//! indices and enum variants form the path (`encoder.Vanilla.layers.0.norm_1.gamma`); every
//! parameter item contributes its id, shape and, on request, its raw element bytes.

use std::{collections::BTreeMap, fmt};

use serde::{ser, Serialize};

/// Element type name that full-precision float tensors are stored with.
pub const FLOAT_DTYPE: &str = "F32";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredParam {
    pub id: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    /// Little-endian element bytes; empty unless collected with data.
    pub bytes: Vec<u8>,
}

impl StoredParam {
    pub fn is_float(&self) -> bool {
        self.dtype == FLOAT_DTYPE
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollectError(String);

impl ser::Error for CollectError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Lists every parameter of `item` by path. Element bytes are copied only when `with_data`.
pub fn collect_params<T: Serialize>(
    item: &T,
    with_data: bool,
) -> Result<BTreeMap<String, StoredParam>, CollectError> {
    let mut collector = Collector {
        path: Vec::new(),
        with_data,
        params: BTreeMap::new(),
    };
    item.serialize(&mut collector)?;
    Ok(collector
        .params
        .into_iter()
        .filter(|(_, param)| !param.id.is_empty() && !param.dtype.is_empty())
        .collect())
}

struct Collector {
    path: Vec<String>,
    with_data: bool,
    params: BTreeMap<String, StoredParam>,
}

impl Collector {
    /// Entry of the parameter whose item contains the current position, `depth` levels up.
    fn param_at(&mut self, depth: usize) -> Option<&mut StoredParam> {
        let prefix = self.path.len().checked_sub(depth)?;
        let key = self.path[..prefix].join(".");
        Some(self.params.entry(key).or_default())
    }

    fn ends_with(&self, suffix: &[&str]) -> bool {
        self.path.len() >= suffix.len()
            && self.path[self.path.len() - suffix.len()..]
                .iter()
                .zip(suffix)
                .all(|(segment, expected)| segment == expected)
    }

    fn scoped<T: ?Sized + Serialize>(&mut self, segment: String, value: &T) -> Result<(), CollectError> {
        self.path.push(segment);
        let result = value.serialize(&mut *self);
        self.path.pop();
        result
    }
}

struct Compound<'a> {
    collector: &'a mut Collector,
    index: usize,
}

impl Compound<'_> {
    fn element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        let segment = self.index.to_string();
        self.index += 1;
        self.collector.scoped(segment, value)
    }
}

impl<'a> ser::Serializer for &'a mut Collector {
    type Ok = ();
    type Error = CollectError;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn serialize_bool(self, _v: bool) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<(), CollectError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<(), CollectError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<(), CollectError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<(), CollectError> {
        // `<param>.param.shape.<axis>`
        let len = self.path.len();
        if len >= 3 && self.path[len - 3] == "param" && self.path[len - 2] == "shape" {
            let dim = usize::try_from(v).map_err(|_| CollectError(format!("dimension {v} overflows")))?;
            if let Some(param) = self.param_at(3) {
                param.shape.push(dim);
            }
        }
        Ok(())
    }

    fn serialize_f32(self, _v: f32) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_f64(self, _v: f64) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_char(self, _v: char) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<(), CollectError> {
        if self.ends_with(&["id"]) {
            if let Some(param) = self.param_at(1) {
                param.id = v.to_string();
            }
        }
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), CollectError> {
        if self.ends_with(&["param", "bytes"]) {
            let with_data = self.with_data;
            if let Some(param) = self.param_at(2) {
                if with_data {
                    param.bytes = v.to_vec();
                }
            }
        }
        Ok(())
    }

    fn serialize_none(self) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), CollectError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<(), CollectError> {
        if self.ends_with(&["param", "dtype"]) {
            if let Some(param) = self.param_at(2) {
                param.dtype = variant.to_string();
            }
        }
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), CollectError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), CollectError> {
        self.scoped(variant.to_string(), value)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound<'a>, CollectError> {
        Ok(Compound {
            collector: self,
            index: 0,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Compound<'a>, CollectError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<Compound<'a>, CollectError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Compound<'a>, CollectError> {
        self.path.push(variant.to_string());
        self.serialize_seq(Some(len))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Compound<'a>, CollectError> {
        self.serialize_seq(len)
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Compound<'a>, CollectError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Compound<'a>, CollectError> {
        self.path.push(variant.to_string());
        self.serialize_seq(Some(len))
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CollectError> {
        Ok(())
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CollectError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CollectError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CollectError> {
        self.collector.path.pop();
        Ok(())
    }
}

/// Map entries are addressed by position; keys are not part of the path.
impl ser::SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, _key: &T) -> Result<(), CollectError> {
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), CollectError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CollectError> {
        Ok(())
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), CollectError> {
        self.collector.scoped(key.to_string(), value)
    }

    fn end(self) -> Result<(), CollectError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = CollectError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), CollectError> {
        self.collector.scoped(key.to_string(), value)
    }

    fn end(self) -> Result<(), CollectError> {
        self.collector.path.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        nn::{Linear, LinearConfig},
        prelude::*,
        record::{FullPrecisionSettings, Record},
    };

    type TestBackend = NdArray;

    #[derive(Module, Debug)]
    struct Stack<B: Backend> {
        layers: Vec<Linear<B>>,
        out: Option<Linear<B>>,
    }

    fn stack(depth: usize, with_out: bool) -> Stack<TestBackend> {
        let device = Default::default();
        Stack {
            layers: (0..depth).map(|_| LinearConfig::new(3, 3).init(&device)).collect(),
            out: with_out.then(|| LinearConfig::new(3, 2).with_bias(false).init(&device)),
        }
    }

    #[test]
    fn params_are_keyed_by_field_path() {
        let model = stack(2, true);
        let item = model.clone().into_record().into_item::<FullPrecisionSettings>();
        let params = collect_params(&item, false).unwrap();

        let paths: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            ["layers.0.bias", "layers.0.weight", "layers.1.bias", "layers.1.weight", "out.weight"]
        );
        let out = &params["out.weight"];
        assert_eq!(out.shape, [3, 2]);
        assert!(out.is_float());
        assert!(out.bytes.is_empty());
        assert_eq!(out.id, model.out.as_ref().unwrap().weight.id.serialize());
    }

    #[test]
    fn data_is_copied_on_request() {
        let model = stack(1, false);
        let expected: Vec<f32> = model.layers[0].weight.val().into_data().to_vec().unwrap();
        let item = model.into_record().into_item::<FullPrecisionSettings>();
        let params = collect_params(&item, true).unwrap();

        let weight = &params["layers.0.weight"];
        let values: Vec<f32> = weight
            .bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(values, expected);
    }
}
