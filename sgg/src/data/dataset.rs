//! COCO-format detection dataset.

use super::transforms::Transforms;
use crate::{common::*, config::SplitConfig};

pub const BACKGROUND_CLASS_NAME: &str = "__background__";

/// The COCO annotation file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoDataset {
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: i64,
    pub file_name: String,
    pub height: usize,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub image_id: i64,
    pub category_id: i64,
    /// Box in `[x, y, width, height]`.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
}

/// A dataset sample after transforms.
#[derive(Debug)]
pub struct Sample {
    /// The normalized image in `[3, height, width]`.
    pub image: Tensor,
    pub annotation: Annotation,
    /// The dataset index of the image.
    pub image_id: usize,
}

/// Images and ground truth boxes indexed from zero.
#[derive(Debug)]
pub struct SceneDataset {
    image_dir: PathBuf,
    images: Vec<CocoImage>,
    annotations: Vec<Annotation>,
    /// Class names indexed by class index, background at zero.
    classes: IndexSet<String>,
    /// Maps class index to COCO category id.
    category_ids: Vec<i64>,
    transforms: Transforms,
}

impl SceneDataset {
    /// Load the annotation file of a split.
    pub fn open(config: &SplitConfig, transforms: Transforms, remove_empty: bool) -> Result<Self> {
        let SplitConfig {
            annotation_file,
            image_dir,
        } = config;

        let text = fs::read_to_string(annotation_file).with_context(|| {
            format!(
                "failed to read annotation file '{}'",
                annotation_file.display()
            )
        })?;
        let coco: CocoDataset = serde_json::from_str(&text).with_context(|| {
            format!(
                "failed to parse annotation file '{}'",
                annotation_file.display()
            )
        })?;

        Self::from_coco(coco, image_dir, transforms, remove_empty)
    }

    pub fn from_coco<P>(
        coco: CocoDataset,
        image_dir: P,
        transforms: Transforms,
        remove_empty: bool,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let CocoDataset {
            images,
            annotations,
            categories,
        } = coco;

        // categories sorted by id map to contiguous indices from 1
        let categories: Vec<_> = categories
            .into_iter()
            .sorted_by_key(|cat| cat.id)
            .collect();
        let category_to_class: HashMap<i64, usize> = categories
            .iter()
            .enumerate()
            .map(|(index, cat)| (cat.id, index + 1))
            .collect();
        ensure!(
            category_to_class.len() == categories.len(),
            "duplicated category ids"
        );

        let classes: IndexSet<String> = iter::once(BACKGROUND_CLASS_NAME.to_string())
            .chain(categories.iter().map(|cat| cat.name.clone()))
            .collect();
        ensure!(
            classes.len() == categories.len() + 1,
            "duplicated category names"
        );
        let category_ids: Vec<i64> = iter::once(0)
            .chain(categories.iter().map(|cat| cat.id))
            .collect();

        let mut objects_per_image: HashMap<i64, Vec<ObjectLabel>> = HashMap::new();
        for ann in annotations {
            if ann.iscrowd != 0 {
                continue;
            }
            let class_index = match category_to_class.get(&ann.category_id) {
                Some(&index) => index,
                None => {
                    warn!(
                        "ignore annotation with unknown category id {}",
                        ann.category_id
                    );
                    continue;
                }
            };
            let [x, y, w, h] = ann.bbox;
            if !(w > 0.0 && h > 0.0) {
                continue;
            }
            let tlbr = TLBR::try_from_tlhw([y, x, h, w])?;
            objects_per_image
                .entry(ann.image_id)
                .or_default()
                .push(ObjectLabel { tlbr, class_index });
        }

        let (images, annotations): (Vec<_>, Vec<_>) = images
            .into_iter()
            .map(|image| {
                let objects = objects_per_image.remove(&image.id).unwrap_or_default();
                let annotation = Annotation {
                    image_size: [image.height, image.width],
                    objects,
                };
                (image, annotation)
            })
            .filter(|(_, annotation)| !remove_empty || !annotation.objects.is_empty())
            .unzip();

        debug!(
            "loaded {} images with {} classes",
            images.len(),
            classes.len()
        );

        Ok(Self {
            image_dir: image_dir.as_ref().to_owned(),
            images,
            annotations,
            classes,
            category_ids,
            transforms,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Class names indexed by class index.
    pub fn ind_to_classes(&self) -> &IndexSet<String> {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn image_info(&self, index: usize) -> Option<&CocoImage> {
        self.images.get(index)
    }

    /// The ground truth in original image size.
    pub fn annotation(&self, index: usize) -> Option<&Annotation> {
        self.annotations.get(index)
    }

    /// The COCO category id of a class index.
    pub fn category_id(&self, class_index: usize) -> Option<i64> {
        self.category_ids.get(class_index).copied()
    }

    pub fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    /// Load and transform the sample at `index`.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let info = self
            .images
            .get(index)
            .ok_or_else(|| format_err!("index {} is out of bound", index))?;
        let annotation = &self.annotations[index];

        let path = self.image_dir.join(&info.file_name);
        let image = vision::image::load(&path)
            .with_context(|| format!("failed to load image '{}'", path.display()))?;
        let (_c, h, w) = image.size3()?;
        let image_size = [h as usize, w as usize];

        // annotation files may disagree with the actual image size
        let annotation = if image_size != annotation.image_size {
            warn!(
                "image '{}' has size {:?} but {:?} is annotated",
                path.display(),
                image_size,
                annotation.image_size
            );
            annotation.resize(image_size)
        } else {
            annotation.clone()
        };

        let (image, annotation) = self.transforms.apply(&image, &annotation)?;

        Ok(Sample {
            image,
            annotation,
            image_id: index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transforms() -> Transforms {
        Transforms {
            min_size: 32,
            max_size: 64,
            pixel_mean: [0.0; 3],
            pixel_std: [1.0; 3],
            to_bgr255: true,
        }
    }

    fn coco() -> CocoDataset {
        serde_json::from_str(
            r#"{
                "images": [
                    {"id": 7, "file_name": "a.png", "height": 20, "width": 30},
                    {"id": 9, "file_name": "b.png", "height": 20, "width": 30}
                ],
                "annotations": [
                    {"image_id": 7, "category_id": 18, "bbox": [1, 2, 10, 5]},
                    {"image_id": 7, "category_id": 3, "bbox": [0, 0, 4, 4], "iscrowd": 1},
                    {"image_id": 7, "category_id": 3, "bbox": [0, 0, 0, 4]}
                ],
                "categories": [
                    {"id": 18, "name": "dog"},
                    {"id": 3, "name": "car"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn categories_map_to_contiguous_indices() -> Result<()> {
        let dataset = SceneDataset::from_coco(coco(), "images", transforms(), false)?;
        let classes: Vec<_> = dataset.ind_to_classes().iter().cloned().collect();
        assert_eq!(classes, vec![BACKGROUND_CLASS_NAME, "car", "dog"]);
        assert_eq!(dataset.category_id(1), Some(3));
        assert_eq!(dataset.category_id(2), Some(18));
        assert_eq!(dataset.category_id(3), None);
        Ok(())
    }

    #[test]
    fn crowd_and_degenerate_boxes_are_dropped() -> Result<()> {
        let dataset = SceneDataset::from_coco(coco(), "images", transforms(), false)?;
        assert_eq!(dataset.len(), 2);

        let annotation = dataset.annotation(0).unwrap();
        assert_eq!(annotation.image_size, [20, 30]);
        assert_eq!(annotation.objects.len(), 1);
        assert_eq!(annotation.objects[0].class_index, 2);
        assert_eq!(annotation.objects[0].tlbr.tlbr(), [2.0, 1.0, 7.0, 11.0]);
        Ok(())
    }

    #[test]
    fn remove_images_without_objects() -> Result<()> {
        let dataset = SceneDataset::from_coco(coco(), "images", transforms(), true)?;
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.image_info(0).unwrap().id, 7);
        Ok(())
    }
}
