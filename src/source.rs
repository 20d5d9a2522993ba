use crate::data::{enumerate_labels, StampGeometry};
use crate::error::{Result, StampNetError};
use flate2::bufread::GzDecoder;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Image and background files making up one training invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StampFiles {
    pub images: Vec<PathBuf>,
    pub backgrounds: Vec<PathBuf>,
}

/// Row-major features plus one raw label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix<L> {
    pub features: Vec<f32>,
    pub n_features: usize,
    pub labels: Vec<L>,
}

/// Provider of training stamps for a set of runs and exposures.
pub trait StampSource {
    type Artifact;
    type Label: Ord + Clone;

    fn training_filenames(&self, runs: &[u32], expids: &[u32]) -> Result<StampFiles>;

    fn design_matrix(
        &self,
        files: &StampFiles,
        artifacts: &[Self::Artifact],
        geometry: StampGeometry,
    ) -> Result<DesignMatrix<Self::Label>>;

    fn enumerate_labels(&self, raw: &[Self::Label]) -> Vec<usize> {
        enumerate_labels(raw)
    }
}

fn extract_text(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let bufreader = BufReader::new(file);
    let mut gz = GzDecoder::new(bufreader);
    let mut text = String::new();
    gz.read_to_string(&mut text)?;
    Ok(text)
}

fn parse_values<'a>(
    fields: impl Iterator<Item = &'a str>,
    path: &Path,
    line: usize,
) -> Result<Vec<f32>> {
    fields
        .map(|field| {
            field.trim().parse::<f32>().map_err(|e| StampNetError::Parse {
                path: path.to_path_buf(),
                line,
                msg: format!("{field:?}: {e}"),
            })
        })
        .collect()
}

/// Gzip-compressed CSV stamps laid out as `<root>/<run>/<expid>.csv.gz`.
///
/// Each line holds `label,v1,...,vK` with `K = gridsize * gridsize`. An optional
/// `<expid>.bkg.csv.gz` next to it holds a single row of K background values
/// subtracted from every stamp of that exposure. Artifacts are label names;
/// when any are given, rows with other labels are skipped.
#[derive(Debug, Clone)]
pub struct GzCsvSource {
    root: PathBuf,
}

impl GzCsvSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn background(&self, path: &Path, n_features: usize) -> Result<Option<Vec<f32>>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = extract_text(path)?;
        let Some((idx, line)) = text.lines().enumerate().find(|(_, l)| !l.trim().is_empty())
        else {
            return Ok(None);
        };
        let values = parse_values(line.split(','), path, idx + 1)?;
        if values.len() != n_features {
            return Err(StampNetError::DataShapeMismatch(format!(
                "{}: background has {} values, expected {n_features}",
                path.display(),
                values.len()
            )));
        }
        Ok(Some(values))
    }
}

impl StampSource for GzCsvSource {
    type Artifact = String;
    type Label = String;

    fn training_filenames(&self, runs: &[u32], expids: &[u32]) -> Result<StampFiles> {
        if runs.len() != expids.len() {
            return Err(StampNetError::DataShapeMismatch(format!(
                "{} runs but {} exposure ids",
                runs.len(),
                expids.len()
            )));
        }
        let mut files = StampFiles::default();
        for (run, expid) in runs.iter().zip(expids) {
            let dir = self.root.join(run.to_string());
            files.images.push(dir.join(format!("{expid}.csv.gz")));
            files.backgrounds.push(dir.join(format!("{expid}.bkg.csv.gz")));
        }
        Ok(files)
    }

    fn design_matrix(
        &self,
        files: &StampFiles,
        artifacts: &[String],
        geometry: StampGeometry,
    ) -> Result<DesignMatrix<String>> {
        let n_features = geometry.n_features();
        let mut features = Vec::new();
        let mut labels = Vec::new();

        for (i, image) in files.images.iter().enumerate() {
            let background = match files.backgrounds.get(i) {
                Some(path) => self.background(path, n_features)?,
                None => None,
            };
            let text = extract_text(image)?;
            let before = labels.len();
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let mut fields = line.split(',');
                let label = fields.next().unwrap_or_default().trim().to_string();
                if !artifacts.is_empty() && !artifacts.contains(&label) {
                    continue;
                }
                let mut values = parse_values(fields, image, idx + 1)?;
                if values.len() != n_features {
                    return Err(StampNetError::DataShapeMismatch(format!(
                        "{}:{}: {} values, geometry needs {n_features}",
                        image.display(),
                        idx + 1,
                        values.len()
                    )));
                }
                if let Some(bkg) = &background {
                    values.iter_mut().zip(bkg).for_each(|(v, b)| *v -= b);
                }
                features.extend(values);
                labels.push(label);
            }
            tracing::debug!(file = %image.display(), rows = labels.len() - before, "Read stamps");
        }

        Ok(DesignMatrix {
            features,
            n_features,
            labels,
        })
    }
}
