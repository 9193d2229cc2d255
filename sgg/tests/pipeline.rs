use anyhow::Result;
use image::{Rgb, RgbImage};
use sgg::config::Config;
use std::{fs, path::Path, sync::Arc};

const IMAGE_SIZE: u32 = 64;
const NUM_IMAGES: usize = 4;

/// Write images with a bright square and its COCO annotation file.
fn write_dataset(dir: &Path) -> Result<()> {
    let image_dir = dir.join("images");
    fs::create_dir_all(&image_dir)?;

    let mut images = vec![];
    let mut annotations = vec![];

    for index in 0..NUM_IMAGES {
        let offset = 4 + index as u32 * 6;
        let side = 24;
        let mut image = RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, Rgb([16, 16, 16]));
        for y in offset..(offset + side) {
            for x in offset..(offset + side) {
                image.put_pixel(x, y, Rgb([240, 200, 40]));
            }
        }
        let file_name = format!("{:04}.png", index);
        image.save(image_dir.join(&file_name))?;

        let image_id = 100 + index;
        images.push(serde_json::json!({
            "id": image_id,
            "file_name": file_name,
            "height": IMAGE_SIZE,
            "width": IMAGE_SIZE,
        }));
        annotations.push(serde_json::json!({
            "image_id": image_id,
            "category_id": 1 + index % 2,
            "bbox": [offset, offset, side, side],
        }));
    }

    let coco = serde_json::json!({
        "images": images,
        "annotations": annotations,
        "categories": [
            {"id": 1, "name": "box"},
            {"id": 2, "name": "tile"},
        ],
    });
    fs::write(
        dir.join("annotations.json"),
        serde_json::to_string_pretty(&coco)?,
    )?;
    Ok(())
}

fn make_config(dir: &Path, max_iter: usize, devices: &str) -> Result<Arc<Config>> {
    let text = format!(
        r#"{{
            model: {{
                scene_parser: {{ num_classes: 3, backbone_channels: [8, 16] }},
            }},
            input: {{
                min_size_train: 64,
                max_size_train: 64,
                min_size_test: 64,
                max_size_test: 64,
            }},
            dataset: {{
                train: {{ annotation_file: "{dir}/annotations.json", image_dir: "{dir}/images" }},
                test: {{ annotation_file: "{dir}/annotations.json", image_dir: "{dir}/images" }},
            }},
            dataloader: {{ size_divisibility: 32, shuffle_seed: 7, prefetch: 1 }},
            solver: {{
                base_lr: 0.001,
                warmup_iters: 2,
                checkpoint_period: 2,
                max_iter: {max_iter},
                ims_per_batch: 2,
            }},
            test: {{ ims_per_batch: 2 }},
            device_config: {devices},
            logging: {{ enable_summary: false, log_period: 1 }},
            output_dir: "{dir}/output",
        }}"#,
        dir = dir.display(),
        max_iter = max_iter,
        devices = devices,
    );

    let config_file = dir.join("sgg.json5");
    fs::write(&config_file, text)?;
    Ok(Arc::new(Config::open(&config_file)?))
}

const SINGLE_CPU: &str = r#"{ type: "SingleDevice", device: "cpu" }"#;
const DOUBLE_CPU: &str = r#"{ type: "MultiDevice", devices: ["cpu", "cpu"] }"#;

#[tokio::test]
async fn train_then_test() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path())?;
    let config = make_config(dir.path(), 4, SINGLE_CPU)?;
    let output_dir = dir.path().join("output");

    let results = sgg::start_train(config.clone(), false).await?;
    let results = results.expect("the main rank returns evaluation results");
    let ap = results.get("bbox", "AP").expect("AP is reported");
    assert!((0.0..=1.0).contains(&ap));

    assert!(output_dir.join("config.json5").is_file());
    assert!(output_dir.join("checkpoint_0000001.ot").is_file());
    assert!(output_dir.join("checkpoint_0000003.ot").is_file());
    assert!(output_dir.join("checkpoint_final.ot").is_file());
    assert_eq!(
        fs::read_to_string(output_dir.join("last_checkpoint"))?.trim(),
        "checkpoint_final.ot"
    );

    let arguments: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output_dir.join("checkpoint_final.json"))?)?;
    assert_eq!(arguments["iteration"], 4);

    let results_dir = output_dir.join("results");
    assert!(results_dir.join("predictions.json").is_file());
    assert!(results_dir.join("bbox.json").is_file());
    assert!(results_dir.join("coco_results.json").is_file());

    // evaluate the restored model
    let results = sgg::start_test(config, true).await?;
    assert!(results.is_some());
    let num_visualized = fs::read_dir(output_dir.join("visualize"))?.count();
    assert_eq!(num_visualized, NUM_IMAGES);

    Ok(())
}

#[tokio::test]
async fn resume_training() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path())?;
    let output_dir = dir.path().join("output");

    let results = sgg::start_train(make_config(dir.path(), 2, SINGLE_CPU)?, true).await?;
    assert!(results.is_none());
    assert!(output_dir.join("checkpoint_0000001.ot").is_file());
    assert!(!output_dir.join("checkpoint_0000003.ot").exists());

    sgg::start_train(make_config(dir.path(), 4, SINGLE_CPU)?, true).await?;
    assert!(output_dir.join("checkpoint_0000003.ot").is_file());

    let arguments: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output_dir.join("checkpoint_final.json"))?)?;
    assert_eq!(arguments["iteration"], 4);
    Ok(())
}

#[tokio::test]
async fn train_on_two_ranks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path())?;
    let config = make_config(dir.path(), 2, DOUBLE_CPU)?;
    let output_dir = dir.path().join("output");

    let results = sgg::start_train(config, false).await?;
    assert!(results.is_some());
    assert!(output_dir.join("checkpoint_final.ot").is_file());

    let predictions: Vec<serde_json::Value> = serde_json::from_str(&fs::read_to_string(
        output_dir.join("results").join("predictions.json"),
    )?)?;
    assert_eq!(predictions.len(), NUM_IMAGES);
    Ok(())
}
