//! Checkpoint save/load for system parameter stores.
//!
//! Serializes every layer's bias/log-variance and every link block's
//! weight and adjacency matrices to JSON. Arrays are converted to nested
//! `Vec`s for serialization; `f64` values survive the round trip
//! bit-identically, adjacency masks boolean-identically.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::links::LinkBlock;
use crate::system::System;
use crate::units::{Layer, UnitClass};

/// Serializable unit layer parameters.
#[derive(Debug, Serialize, Deserialize)]
pub struct LayerData {
    pub name: String,
    /// Unit class name ("bernoulli" or "gauss")
    pub class: String,
    pub visible: bool,
    pub labels: Vec<String>,
    pub bias: Vec<f64>,
    /// Empty for Bernoulli layers
    pub lvar: Vec<f64>,
}

/// Serializable link block parameters.
#[derive(Debug, Serialize, Deserialize)]
pub struct LinkData {
    pub source: usize,
    pub target: usize,
    pub weights: Vec<Vec<f64>>,
    pub adjacency: Vec<Vec<bool>>,
}

/// Serializable checkpoint: full parameter store plus run context.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointData {
    pub layers: Vec<LayerData>,
    pub links: Vec<LinkData>,
    pub mapping: Vec<usize>,
    /// Epoch at which this checkpoint was saved
    pub epoch: usize,
    /// Objective value at checkpoint time
    pub objective_value: f64,
}

fn matrix_to_vecs<T: Clone>(arr: &Array2<T>) -> Vec<Vec<T>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn vecs_to_matrix<T: Clone>(vecs: &[Vec<T>]) -> Result<Array2<T>, String> {
    if vecs.is_empty() {
        return Array2::from_shape_vec((0, 0), Vec::new())
            .map_err(|e| format!("Failed to build empty matrix: {e}"));
    }
    let nrows = vecs.len();
    let ncols = vecs[0].len();
    let flat: Vec<T> = vecs.iter().flat_map(|r| r.iter().cloned()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| format!("Failed to reconstruct matrix: {e}"))
}

fn class_name(class: UnitClass) -> &'static str {
    match class {
        UnitClass::Bernoulli => "bernoulli",
        UnitClass::Gauss => "gauss",
    }
}

fn class_from_name(name: &str) -> Result<UnitClass, String> {
    match name {
        "bernoulli" => Ok(UnitClass::Bernoulli),
        "gauss" => Ok(UnitClass::Gauss),
        _ => Err(format!("Unknown unit class: {name}")),
    }
}

/// Save a system's full parameter store to a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be
/// serialized.
pub fn save_params(
    system: &System,
    path: &Path,
    epoch: usize,
    objective_value: f64,
) -> Result<(), String> {
    let data = CheckpointData {
        layers: system
            .layers()
            .iter()
            .map(|layer| LayerData {
                name: layer.name.clone(),
                class: class_name(layer.class).to_string(),
                visible: layer.visible,
                labels: layer.labels.clone(),
                bias: layer.bias.to_vec(),
                lvar: layer.lvar.to_vec(),
            })
            .collect(),
        links: system
            .links()
            .map(|block| LinkData {
                source: block.source,
                target: block.target,
                weights: matrix_to_vecs(&block.w),
                adjacency: matrix_to_vecs(&block.a),
            })
            .collect(),
        mapping: system.mapping().to_vec(),
        epoch,
        objective_value,
    };

    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| format!("Failed to serialize checkpoint: {e}"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create checkpoint directory: {e}"))?;
    }

    std::fs::write(path, json)
        .map_err(|e| format!("Failed to write checkpoint to {}: {e}", path.display()))
}

/// Load a system's parameter store from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or the system
/// cannot be reconstructed.
pub fn load_params(path: &Path) -> Result<(CheckpointData, System), String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read checkpoint from {}: {e}", path.display()))?;

    let data: CheckpointData =
        serde_json::from_str(&json).map_err(|e| format!("Failed to parse checkpoint: {e}"))?;

    let mut layers = Vec::with_capacity(data.layers.len());
    for layer in &data.layers {
        layers.push(Layer {
            name: layer.name.clone(),
            labels: layer.labels.clone(),
            visible: layer.visible,
            class: class_from_name(&layer.class)?,
            bias: Array1::from(layer.bias.clone()),
            lvar: Array1::from(layer.lvar.clone()),
        });
    }

    let mut links = Vec::with_capacity(data.links.len());
    for link in &data.links {
        links.push(LinkBlock {
            source: link.source,
            target: link.target,
            a: vecs_to_matrix(&link.adjacency)?,
            w: vecs_to_matrix(&link.weights)?,
        });
    }

    let system = System::from_parts(layers, links, data.mapping.clone())
        .map_err(|e| format!("Failed to reconstruct system: {e}"))?;

    Ok((data, system))
}
