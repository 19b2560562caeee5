//! Image source and metadata sink consumed by a run.

use std::collections::{BTreeMap, HashMap};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Cl2dError, Cl2dResult};
use crate::image::{apply_geometry, Geometry, ImageId, ImageRecord};

/// Read access to the images of a run. Shared by all workers.
pub trait ImageStore: Sync {
    /// Every image of the run, in a stable order.
    fn ids(&self) -> Vec<ImageId>;

    fn read(&self, id: ImageId) -> Cl2dResult<Array2<f64>>;

    /// The image with its stored alignment already applied.
    fn read_with_geometry(&self, id: ImageId) -> Cl2dResult<Array2<f64>> {
        self.read(id)
    }

    fn weight(&self, _id: ImageId) -> f64 {
        1.0
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryImageStore {
    order: Vec<ImageId>,
    records: HashMap<ImageId, ImageRecord>,
    geometry: HashMap<ImageId, Geometry>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from records, keeping their order.
    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: ImageRecord) {
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id);
        }
        self.records.insert(record.id, record);
    }

    /// Alignment applied by [`ImageStore::read_with_geometry`].
    pub fn set_geometry(&mut self, id: ImageId, geometry: Geometry) {
        self.geometry.insert(id, geometry);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl ImageStore for InMemoryImageStore {
    fn ids(&self) -> Vec<ImageId> {
        self.order.clone()
    }

    fn read(&self, id: ImageId) -> Cl2dResult<Array2<f64>> {
        self.records
            .get(&id)
            .map(|record| record.pixels.clone())
            .ok_or_else(|| Cl2dError::ImageStore {
                id,
                reason: "unknown image".to_string(),
            })
    }

    fn read_with_geometry(&self, id: ImageId) -> Cl2dResult<Array2<f64>> {
        let pixels = self.read(id)?;
        Ok(match self.geometry.get(&id) {
            Some(geometry) => apply_geometry(&pixels, &geometry.to_affine()),
            None => pixels,
        })
    }

    fn weight(&self, id: ImageId) -> f64 {
        self.records.get(&id).map_or(1.0, |record| record.weight)
    }
}

/// Fixed columns written back for every image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    /// Class index, `-1` when unclassified.
    pub class_ref: i64,
    pub flip: bool,
    pub shift_x: f64,
    pub shift_y: f64,
    pub psi: f64,
    /// `1` for classified images, `-1` otherwise.
    pub enabled: i32,
}

impl MetadataRow {
    pub fn classified(class_ref: usize, geometry: &Geometry) -> Self {
        Self {
            class_ref: class_ref as i64,
            flip: geometry.flip,
            shift_x: geometry.shift_x,
            shift_y: geometry.shift_y,
            psi: geometry.psi,
            enabled: 1,
        }
    }

    pub fn unclassified() -> Self {
        Self {
            class_ref: -1,
            flip: false,
            shift_x: 0.0,
            shift_y: 0.0,
            psi: 0.0,
            enabled: -1,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            psi: self.psi,
            shift_x: self.shift_x,
            shift_y: self.shift_y,
            flip: self.flip,
        }
    }
}

pub trait MetadataTable {
    fn ids(&self) -> Vec<ImageId>;

    fn row(&self, id: ImageId) -> Option<MetadataRow>;

    fn set_row(&mut self, id: ImageId, row: MetadataRow);
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InMemoryMetadata {
    rows: BTreeMap<u64, MetadataRow>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl MetadataTable for InMemoryMetadata {
    fn ids(&self) -> Vec<ImageId> {
        self.rows.keys().copied().map(ImageId).collect()
    }

    fn row(&self, id: ImageId) -> Option<MetadataRow> {
        self.rows.get(&id.0).copied()
    }

    fn set_row(&mut self, id: ImageId, row: MetadataRow) {
        self.rows.insert(id.0, row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_keeps_insertion_order_and_weights() {
        let store = InMemoryImageStore::from_records([
            ImageRecord::new(ImageId(7), Array2::zeros((4, 4))),
            ImageRecord::new(ImageId(3), Array2::ones((4, 4))).with_weight(2.5),
        ]);
        assert_eq!(store.ids(), vec![ImageId(7), ImageId(3)]);
        assert_eq!(store.weight(ImageId(3)), 2.5);
        assert_eq!(store.weight(ImageId(7)), 1.0);
        assert_eq!(store.read(ImageId(3)).unwrap()[[1, 1]], 1.0);
    }

    #[test]
    fn unknown_image_is_a_store_error() {
        let store = InMemoryImageStore::new();
        assert!(matches!(
            store.read(ImageId(1)),
            Err(Cl2dError::ImageStore { id: ImageId(1), .. })
        ));
    }

    #[test]
    fn stored_geometry_is_applied_on_request() {
        let mut pixels = Array2::zeros((8, 8));
        pixels[[4, 4]] = 1.0;
        let mut store = InMemoryImageStore::from_records([ImageRecord::new(ImageId(0), pixels)]);
        store.set_geometry(
            ImageId(0),
            Geometry {
                shift_x: 1.0,
                ..Default::default()
            },
        );
        assert_eq!(store.read(ImageId(0)).unwrap()[[4, 4]], 1.0);
        let moved = store.read_with_geometry(ImageId(0)).unwrap();
        assert!((moved[[4, 5]] - 1.0).abs() < 1e-12);
        assert!(moved[[4, 4]].abs() < 1e-12);
    }

    #[test]
    fn metadata_rows_round_trip_geometry() {
        let geometry = Geometry {
            psi: 30.0,
            shift_x: -1.0,
            shift_y: 2.0,
            flip: true,
        };
        let mut table = InMemoryMetadata::new();
        table.set_row(ImageId(5), MetadataRow::classified(2, &geometry));
        table.set_row(ImageId(1), MetadataRow::unclassified());
        assert_eq!(table.ids(), vec![ImageId(1), ImageId(5)]);
        let row = table.row(ImageId(5)).unwrap();
        assert_eq!(row.class_ref, 2);
        assert_eq!(row.geometry(), geometry);
        assert_eq!(table.row(ImageId(1)).unwrap().enabled, -1);
        assert_eq!(table.row(ImageId(9)), None);
    }
}
