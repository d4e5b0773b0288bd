//! Manifest documents exchanged between the writer and the streaming side.
//!
//! Field names are the wire contract and must not change:
//! ```text
//! { geometries: {elementId: {tileId, geometryFile, boundingBox, offset, length}},
//!   assets: [{id, type, color?}], types: {typeName: [tileId...]},
//!   globalDataFileId }
//! { types: {typeName: [batchId...]}, ids: {elementId: batchId}, indexesFile }
//! ```

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use bimtiles_common::{BatchId, BoundingBox, ElementId, TileId};

/// Key/value pairs serialized as a JSON object, keeping every entry on read.
///
/// A plain map silently keeps the last of two duplicate keys; this keeps
/// both so that index construction can reject the manifest instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Entries<K, V>(pub Vec<(K, V)>);

impl<K, V> Default for Entries<K, V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<K, V> Entries<K, V> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter().map(|(k, v)| (k, v))
    }
}

impl<K: Ord, V> From<BTreeMap<K, V>> for Entries<K, V> {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl<K: Serialize, V: Serialize> Serialize for Entries<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, K: Deserialize<'de>, V: Deserialize<'de>> Deserialize<'de> for Entries<K, V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<K, V>(PhantomData<(K, V)>);

        impl<'de, K: Deserialize<'de>, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<K, V> {
            type Value = Entries<K, V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

/// Where one element's geometry lives.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryEntry {
    pub tile_id: TileId,
    pub geometry_file: String,
    pub bounding_box: BoundingBox,
    /// Offset of the element record in the decompressed tile.
    pub offset: u64,
    pub length: u64,
}

/// Per-element scene metadata carried alongside the geometry lookup.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssetRecord {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[f32; 4]>,
}

/// Geometry manifest (`<model>-processed.json`).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryManifest {
    pub geometries: Entries<ElementId, GeometryEntry>,
    pub assets: Vec<AssetRecord>,
    pub types: Entries<String, Vec<TileId>>,
    pub global_data_file_id: String,
}

/// Properties manifest (`<model>-processed-properties.json`).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesManifest {
    pub types: Entries<String, Vec<BatchId>>,
    pub ids: Entries<ElementId, BatchId>,
    pub indexes_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn geometry_manifest_uses_wire_field_names() {
        let manifest = GeometryManifest {
            geometries: Entries(vec![(
                ElementId(12),
                GeometryEntry {
                    tile_id: TileId(1),
                    geometry_file: "m-processed-geometries-1".into(),
                    bounding_box: BoundingBox::new(Vec3::ZERO, Vec3::ONE),
                    offset: 0,
                    length: 16,
                },
            )]),
            assets: vec![AssetRecord {
                id: ElementId(12),
                type_name: "IFCWALL".into(),
                color: None,
            }],
            types: Entries(vec![("IFCWALL".into(), vec![TileId(1)])]),
            global_data_file_id: "m-processed-global".into(),
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["geometries"]["12"]["tileId"], 1);
        assert_eq!(value["geometries"]["12"]["geometryFile"], "m-processed-geometries-1");
        assert_eq!(value["assets"][0]["type"], "IFCWALL");
        assert!(value["assets"][0].get("color").is_none());
        assert_eq!(value["types"]["IFCWALL"][0], 1);
        assert_eq!(value["globalDataFileId"], "m-processed-global");
    }

    #[test]
    fn properties_manifest_uses_wire_field_names() {
        let manifest = PropertiesManifest {
            types: Entries(vec![("IFCDOOR".into(), vec![BatchId(1), BatchId(2)])]),
            ids: Entries(vec![(ElementId(3), BatchId(2))]),
            indexes_file: "m-processed-properties-indexes".into(),
        };
        let text = serde_json::to_string(&manifest).unwrap();
        assert_eq!(
            text,
            r#"{"types":{"IFCDOOR":[1,2]},"ids":{"3":2},"indexesFile":"m-processed-properties-indexes"}"#
        );
    }

    #[test]
    fn duplicate_keys_survive_deserialization() {
        let text = r#"{"types":{},"ids":{"3":1,"3":2},"indexesFile":"x"}"#;
        let manifest: PropertiesManifest = serde_json::from_str(text).unwrap();
        assert_eq!(manifest.ids.len(), 2);
    }
}
