//! Ordered layer sets and utility VM image discovery.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory inside a read-only layer that holds a utility VM image.
pub const UVM_IMAGE_DIR: &str = "UtilityVM";

/// Reasons a list of layer paths is not a usable layer set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// No paths at all; the scratch is required
    #[error("layer set is empty")]
    Empty,

    /// A path at the given position is empty
    #[error("layer {0} has an empty path")]
    EmptyPath(usize),

    /// The same path appears twice
    #[error("duplicate layer path: {}", .0.display())]
    Duplicate(PathBuf),

    /// No read-only layer carries a utility VM image
    #[error("no read-only layer contains a UtilityVM directory")]
    UvmImageNotFound,
}

/// An ordered list of layer paths: zero or more read-only layers followed
/// by exactly one writable scratch.
///
/// Two sets are equal when they list the same paths in the same order,
/// which is what the mount coordinator keys shared roots on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<PathBuf>", into = "Vec<PathBuf>")]
pub struct LayerSet {
    layers: Vec<PathBuf>,
}

impl LayerSet {
    /// Build a set from paths in declared order; the last is the scratch.
    pub fn new<I, P>(paths: I) -> Result<Self, LayerError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let layers: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if layers.is_empty() {
            return Err(LayerError::Empty);
        }

        let mut seen = HashSet::with_capacity(layers.len());
        for (index, path) in layers.iter().enumerate() {
            if path.as_os_str().is_empty() {
                return Err(LayerError::EmptyPath(index));
            }
            if !seen.insert(path) {
                return Err(LayerError::Duplicate(path.clone()));
            }
        }

        Ok(Self { layers })
    }

    /// Build a set from read-only layers and a separate scratch.
    pub fn with_scratch<I, P>(read_only: I, scratch: impl Into<PathBuf>) -> Result<Self, LayerError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut paths: Vec<PathBuf> = read_only.into_iter().map(Into::into).collect();
        paths.push(scratch.into());
        Self::new(paths)
    }

    /// Read-only layers, in declared order.
    pub fn read_only(&self) -> &[PathBuf] {
        &self.layers[..self.layers.len() - 1]
    }

    /// The writable scratch.
    pub fn scratch(&self) -> &Path {
        &self.layers[self.layers.len() - 1]
    }

    /// Number of layers including the scratch.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false; a set holds at least the scratch.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Every layer with its read-only flag, in declared order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = (&Path, bool)> + '_ {
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .map(move |(i, p)| (p.as_path(), i != last))
    }

    /// All paths, in declared order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.layers
    }
}

impl TryFrom<Vec<PathBuf>> for LayerSet {
    type Error = LayerError;

    fn try_from(paths: Vec<PathBuf>) -> Result<Self, Self::Error> {
        Self::new(paths)
    }
}

impl From<LayerSet> for Vec<PathBuf> {
    fn from(set: LayerSet) -> Self {
        set.layers
    }
}

/// Find the utility VM image among the read-only layers of `layers`.
///
/// Layers are searched in declared order; the first one containing a
/// [`UVM_IMAGE_DIR`] directory wins.
pub fn locate_uvm_image(layers: &LayerSet) -> Result<PathBuf, LayerError> {
    locate_uvm_image_with(layers, Path::is_dir)
}

/// Same as [`locate_uvm_image`] with a custom existence probe.
pub fn locate_uvm_image_with(
    layers: &LayerSet,
    probe: impl Fn(&Path) -> bool,
) -> Result<PathBuf, LayerError> {
    layers
        .read_only()
        .iter()
        .map(|layer| layer.join(UVM_IMAGE_DIR))
        .find(|candidate| probe(candidate.as_path()))
        .ok_or(LayerError::UvmImageNotFound)
}
