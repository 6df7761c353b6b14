//! Parameter snapshots keyed by variable name.

use crate::{common::*, error::DetectorError};

/// The outcome of loading a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotReport {
    /// Variables restored from the snapshot.
    pub loaded: Vec<String>,
    /// Snapshot entries without a matching variable.
    pub ignored: Vec<String>,
    /// Variables the snapshot does not provide.
    pub missing: Vec<String>,
}

/// Save all variables of `vs` to a snapshot file.
pub fn save<P>(vs: &nn::VarStore, path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    vs.save(path)
        .with_context(|| format!("unable to save snapshot '{}'", path.display()))?;
    info!("saved snapshot {}", path.display());
    Ok(())
}

/// Restore variables from a snapshot file.
///
/// Entries absent from the current variables are skipped, so that a snapshot
/// of a larger architecture can initialize a smaller one. A shape mismatch on
/// a common name is an error.
pub fn load<P>(vs: &mut nn::VarStore, path: P) -> Result<SnapshotReport>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    info!("load snapshot {}", path.display());

    let entries = Tensor::load_multi(path)
        .with_context(|| format!("unable to load snapshot '{}'", path.display()))?;
    let mut variables = vs.variables();
    let mut report = SnapshotReport::default();

    tch::no_grad(|| -> Result<()> {
        for (name, value) in entries {
            let mut var = match variables.remove(&name) {
                Some(var) => var,
                None => {
                    debug!("ignore snapshot entry '{}'", name);
                    report.ignored.push(name);
                    continue;
                }
            };

            ensure!(
                var.size() == value.size(),
                DetectorError::shape(format!(
                    "snapshot entry '{}' has shape {:?}, but the variable has shape {:?}",
                    name,
                    value.size(),
                    var.size()
                ))
            );
            var.f_copy_(&value.to_device(var.device()).to_kind(var.kind()))?;
            report.loaded.push(name);
        }
        Ok(())
    })?;

    report.missing = variables.into_keys().sorted().collect();
    for name in &report.missing {
        warn!("variable '{}' is not found in the snapshot", name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entries_are_ignored() -> Result<()> {
        let path = std::env::temp_dir().join(format!("rcnn-dl-snapshot-{}.ot", std::process::id()));

        let source = nn::VarStore::new(Device::Cpu);
        {
            let root = source.root();
            root.ones("shared", &[2, 3]);
            root.zeros("extra", &[4]);
        }
        save(&source, &path)?;

        let mut target = nn::VarStore::new(Device::Cpu);
        let (shared, fresh) = {
            let root = target.root();
            (root.zeros("shared", &[2, 3]), root.zeros("fresh", &[1]))
        };
        let report = load(&mut target, &path)?;
        std::fs::remove_file(&path)?;

        assert_eq!(report.loaded, vec!["shared".to_string()]);
        assert_eq!(report.ignored, vec!["extra".to_string()]);
        assert_eq!(report.missing, vec!["fresh".to_string()]);
        assert_eq!(f64::from(shared.sum(Kind::Float)), 6.0);
        assert_eq!(f64::from(fresh.sum(Kind::Float)), 0.0);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_rejected() -> Result<()> {
        let path = std::env::temp_dir().join(format!("rcnn-dl-mismatch-{}.ot", std::process::id()));

        let source = nn::VarStore::new(Device::Cpu);
        source.root().ones("weight", &[3]);
        save(&source, &path)?;

        let mut target = nn::VarStore::new(Device::Cpu);
        target.root().zeros("weight", &[4]);
        let result = load(&mut target, &path);
        std::fs::remove_file(&path)?;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectorError>(),
            Some(DetectorError::InputShape(_))
        ));
        Ok(())
    }
}
