//! Model checkpoint saving and loading.

use crate::{common::*, config::LoadCheckpoint};

const LAST_CHECKPOINT_FILE: &str = "last_checkpoint";
const WEIGHTS_EXT: &str = "ot";
const ARGUMENTS_EXT: &str = "json";

/// Training state stored along with the weights.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments {
    /// The iteration to start from.
    pub iteration: usize,
}

/// Saves weights and arguments under the output directory.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    output_dir: PathBuf,
    save_to_disk: bool,
}

impl Checkpointer {
    /// Create a checkpointer. Only the one with `save_to_disk` writes files.
    pub fn new<P>(output_dir: P, save_to_disk: bool) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            output_dir: output_dir.as_ref().to_owned(),
            save_to_disk,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `<name>.ot`, `<name>.json` and point `last_checkpoint` to it.
    pub fn save(&self, vs: &nn::VarStore, name: &str, arguments: &Arguments) -> Result<()> {
        if !self.save_to_disk {
            return Ok(());
        }

        fs::create_dir_all(&self.output_dir)?;
        let weights_file = self
            .output_dir
            .join(format!("{}.{}", name, WEIGHTS_EXT));
        let arguments_file = weights_file.with_extension(ARGUMENTS_EXT);
        info!("saving checkpoint to {}", weights_file.display());

        vs.save(&weights_file)?;
        fs::write(&arguments_file, serde_json::to_string_pretty(arguments)?)?;
        self.tag_last_checkpoint(&weights_file)?;

        Ok(())
    }

    /// Load weights with the given method and return the stored arguments, if any.
    pub fn load(&self, vs: &mut nn::VarStore, resume: &LoadCheckpoint) -> Result<Option<Arguments>> {
        let weights_file = match resume {
            LoadCheckpoint::Disabled => {
                info!("checkpoint loading is disabled");
                None
            }
            LoadCheckpoint::FromRecent => {
                let file = self.last_checkpoint_file()?;
                if file.is_none() {
                    info!("no checkpoint found, initializing model from scratch");
                }
                file
            }
            LoadCheckpoint::FromFile { file } => {
                ensure!(
                    file.is_file(),
                    "checkpoint file '{}' does not exist",
                    file.display()
                );
                Some(file.to_owned())
            }
        };

        let weights_file = match weights_file {
            Some(file) => file,
            None => return Ok(None),
        };

        info!("loading checkpoint from {}", weights_file.display());
        let missing = vs
            .load_partial(&weights_file)
            .with_context(|| format!("failed to load '{}'", weights_file.display()))?;
        if !missing.is_empty() {
            warn!(
                "{} variables are missing in the checkpoint: {}",
                missing.len(),
                missing.join(", ")
            );
        }

        let arguments_file = weights_file.with_extension(ARGUMENTS_EXT);
        let arguments = if arguments_file.is_file() {
            let text = fs::read_to_string(&arguments_file)?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse '{}'", arguments_file.display()))?
        } else {
            warn!(
                "'{}' is not found, use default arguments",
                arguments_file.display()
            );
            Arguments::default()
        };

        Ok(Some(arguments))
    }

    pub fn has_checkpoint(&self) -> bool {
        self.output_dir.join(LAST_CHECKPOINT_FILE).is_file()
    }

    /// The weights file recorded in `last_checkpoint`.
    pub fn last_checkpoint_file(&self) -> Result<Option<PathBuf>> {
        let tag_file = self.output_dir.join(LAST_CHECKPOINT_FILE);
        if !tag_file.is_file() {
            return Ok(None);
        }

        let text = fs::read_to_string(&tag_file)?;
        let name = text.trim();
        if name.is_empty() {
            return Ok(None);
        }

        let path = Path::new(name);
        let path = if path.is_absolute() {
            path.to_owned()
        } else {
            self.output_dir.join(path)
        };
        Ok(Some(path))
    }

    fn tag_last_checkpoint(&self, weights_file: &Path) -> Result<()> {
        let file_name = weights_file
            .file_name()
            .ok_or_else(|| format_err!("invalid checkpoint path '{}'", weights_file.display()))?;
        let tag_file = self.output_dir.join(LAST_CHECKPOINT_FILE);
        fs::write(tag_file, file_name.to_string_lossy().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var_store() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().zeros("weight", &[2, 3]);
        (vs, weight)
    }

    #[test]
    fn save_and_load_recent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpointer = Checkpointer::new(dir.path(), true);

        let (vs, mut weight) = var_store();
        tch::no_grad(|| weight.fill_(1.5));
        checkpointer.save(&vs, "checkpoint_0000010", &Arguments { iteration: 10 })?;

        assert!(checkpointer.has_checkpoint());
        assert_eq!(
            checkpointer.last_checkpoint_file()?,
            Some(dir.path().join("checkpoint_0000010.ot"))
        );

        let (mut restored, restored_weight) = var_store();
        let arguments = checkpointer.load(&mut restored, &LoadCheckpoint::FromRecent)?;
        assert_eq!(arguments, Some(Arguments { iteration: 10 }));
        assert_eq!(f64::from(&restored_weight.sum(Kind::Float)), 9.0);
        Ok(())
    }

    #[test]
    fn non_main_process_does_not_save() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpointer = Checkpointer::new(dir.path(), false);
        let (vs, _weight) = var_store();
        checkpointer.save(&vs, "checkpoint_final", &Arguments { iteration: 1 })?;

        assert!(!checkpointer.has_checkpoint());
        assert!(!dir.path().join("checkpoint_final.ot").exists());
        Ok(())
    }

    #[test]
    fn load_without_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpointer = Checkpointer::new(dir.path(), true);
        let (mut vs, _weight) = var_store();

        assert_eq!(checkpointer.load(&mut vs, &LoadCheckpoint::FromRecent)?, None);
        assert_eq!(checkpointer.load(&mut vs, &LoadCheckpoint::Disabled)?, None);
        assert!(checkpointer
            .load(
                &mut vs,
                &LoadCheckpoint::FromFile {
                    file: dir.path().join("missing.ot")
                }
            )
            .is_err());
        Ok(())
    }
}
