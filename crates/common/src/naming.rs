use crate::types::{BatchId, TileId};

/// File names of every chunk produced for one model.
///
/// Names derive from the model's file name so several converted models can
/// share one directory: `small.ifc` yields `small.ifc-processed.json`,
/// `small.ifc-processed-geometries-1`, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkNaming {
    model: String,
}

impl ChunkNaming {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn geometry_tile(&self, id: TileId) -> String {
        format!("{}-processed-geometries-{}", self.model, id.0)
    }

    pub fn global(&self) -> String {
        format!("{}-processed-global", self.model)
    }

    pub fn geometry_manifest(&self) -> String {
        format!("{}-processed.json", self.model)
    }

    pub fn property_batch(&self, id: BatchId) -> String {
        format!("{}-properties-{}", self.model, id.0)
    }

    pub fn properties_indexes(&self) -> String {
        format!("{}-processed-properties-indexes", self.model)
    }

    pub fn properties_manifest(&self) -> String {
        format!("{}-processed-properties.json", self.model)
    }

    pub fn integrity(&self) -> String {
        format!("{}-processed-integrity.json", self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_model_prefix() {
        let n = ChunkNaming::new("small.ifc");
        assert_eq!(n.geometry_tile(TileId(3)), "small.ifc-processed-geometries-3");
        assert_eq!(n.global(), "small.ifc-processed-global");
        assert_eq!(n.geometry_manifest(), "small.ifc-processed.json");
        assert_eq!(n.property_batch(BatchId(1)), "small.ifc-properties-1");
        assert_eq!(n.properties_indexes(), "small.ifc-processed-properties-indexes");
        assert_eq!(n.properties_manifest(), "small.ifc-processed-properties.json");
    }
}
