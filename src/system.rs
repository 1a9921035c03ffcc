//! Composed layer/link parameter stack with propagation operations.
//!
//! A [`System`] owns an ordered list of unit layers and one link block per
//! adjacent pair, plus a `mapping` describing the layer visitation order
//! for propagation: `(visible, hidden, visible)` for a two-layer RBM,
//! `0..n` for a deep feed-forward stack. All parameter mutation during
//! optimization goes through the system's stores; shape-changing
//! operations ([`System::remove_units`], [`System::prune_links`]) compact
//! units and incident links in a single call so the shape invariants never
//! break across an API boundary.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;

use crate::data::Dataset;
use crate::links::LinkBlock;
use crate::tracker::Objective;
use crate::units::{column_means, Layer, UnitClass};
use crate::{InitConfig, ModelError, ModelResult};

/// Per-layer description supplied by the network/topology collaborator.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub name: String,
    pub labels: Vec<String>,
    pub visible: bool,
    pub class: UnitClass,
}

impl LayerSpec {
    /// Layer description with explicit unit labels.
    pub fn with_labels(name: &str, labels: Vec<String>, visible: bool, class: UnitClass) -> Self {
        Self {
            name: name.to_string(),
            labels,
            visible,
            class,
        }
    }

    /// Layer description with `n` generated labels `name:0 .. name:n-1`.
    pub fn sized(name: &str, n: usize, visible: bool, class: UnitClass) -> Self {
        let labels = (0..n).map(|i| format!("{name}:{i}")).collect();
        Self::with_labels(name, labels, visible, class)
    }
}

/// Ordered layer list read once at configuration time.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub layers: Vec<LayerSpec>,
}

impl Topology {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self { layers }
    }
}

/// Deep copy of all unit and link parameters, used by the tracker's
/// keep-optimum policy and by checkpointing.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    layers: Vec<Layer>,
    links: Vec<LinkBlock>,
}

/// Ordered layers, link blocks per adjacent pair, and a propagation mapping.
#[derive(Debug, Clone)]
pub struct System {
    layers: Vec<Layer>,
    links: BTreeMap<(usize, usize), LinkBlock>,
    mapping: Vec<usize>,
    use_adjacency: bool,
}

impl System {
    /// Build a system from a topology: one layer per spec, one fully
    /// connected link block per adjacent pair, mapping `0..n`.
    pub fn from_topology(topology: &Topology) -> ModelResult<Self> {
        if topology.layers.len() < 2 {
            return Err(ModelError::InvalidConfig(
                "a system needs at least 2 layers".to_string(),
            ));
        }
        let layers: Vec<Layer> = topology
            .layers
            .iter()
            .map(|spec| Layer::new(&spec.name, spec.labels.clone(), spec.visible, spec.class))
            .collect();
        let mut links = BTreeMap::new();
        for i in 0..layers.len() - 1 {
            links.insert(
                (i, i + 1),
                LinkBlock::new(i, i + 1, layers[i].len(), layers[i + 1].len()),
            );
        }
        let mapping = (0..layers.len()).collect();
        Ok(Self {
            layers,
            links,
            mapping,
            use_adjacency: false,
        })
    }

    /// Reassemble a system from raw parts (checkpoint restore path).
    pub fn from_parts(
        layers: Vec<Layer>,
        link_blocks: Vec<LinkBlock>,
        mapping: Vec<usize>,
    ) -> ModelResult<Self> {
        if layers.len() < 2 {
            return Err(ModelError::InvalidConfig(
                "a system needs at least 2 layers".to_string(),
            ));
        }
        let mut links = BTreeMap::new();
        for block in link_blocks {
            if block.source >= layers.len() || block.target >= layers.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "link ({}, {}) references a missing layer",
                    block.source, block.target
                )));
            }
            links.insert((block.source, block.target), block);
        }
        let system = Self {
            layers,
            links,
            mapping,
            use_adjacency: false,
        };
        system.check_shapes()?;
        for &idx in &system.mapping {
            if idx >= system.layers.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "mapping references missing layer index {idx}"
                )));
            }
        }
        Ok(system)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkBlock> {
        self.links.values()
    }

    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }

    /// Set the propagation mapping. Every step must cross an existing link
    /// block in either orientation.
    pub fn set_mapping(&mut self, mapping: Vec<usize>) -> ModelResult<()> {
        for pair in mapping.windows(2) {
            let (s, t) = (pair[0], pair[1]);
            if s >= self.layers.len() || t >= self.layers.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "mapping references missing layer index {}",
                    s.max(t)
                )));
            }
            if !self.links.contains_key(&(s, t)) && !self.links.contains_key(&(t, s)) {
                return Err(ModelError::InvalidConfig(format!(
                    "mapping step {s} -> {t} has no link block"
                )));
            }
        }
        self.mapping = mapping;
        Ok(())
    }

    pub fn use_adjacency(&self) -> bool {
        self.use_adjacency
    }

    pub fn set_use_adjacency(&mut self, enable: bool) {
        self.use_adjacency = enable;
    }

    /// Index of a layer by name; unknown names fail immediately.
    pub fn layer_index(&self, name: &str) -> ModelResult<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| ModelError::UnknownLayer(name.to_string()))
    }

    pub fn layer(&self, name: &str) -> ModelResult<&Layer> {
        let idx = self.layer_index(name)?;
        Ok(&self.layers[idx])
    }

    pub fn layer_mut(&mut self, name: &str) -> ModelResult<&mut Layer> {
        let idx = self.layer_index(name)?;
        Ok(&mut self.layers[idx])
    }

    pub fn layer_at(&self, idx: usize) -> &Layer {
        &self.layers[idx]
    }

    pub fn layer_at_mut(&mut self, idx: usize) -> &mut Layer {
        &mut self.layers[idx]
    }

    /// Stored link block between two layer indices, direct orientation only.
    pub fn link(&self, source: usize, target: usize) -> ModelResult<&LinkBlock> {
        self.links
            .get(&(source, target))
            .ok_or_else(|| ModelError::InvalidConfig(format!("no link block ({source}, {target})")))
    }

    pub fn link_mut(&mut self, source: usize, target: usize) -> ModelResult<&mut LinkBlock> {
        self.links
            .get_mut(&(source, target))
            .ok_or_else(|| ModelError::InvalidConfig(format!("no link block ({source}, {target})")))
    }

    /// Weight matrix for a propagation step, transposing the stored block
    /// when the requested direction is the reverse of the stored one.
    pub fn weights_between(&self, source: usize, target: usize) -> ModelResult<Array2<f64>> {
        if let Some(block) = self.links.get(&(source, target)) {
            Ok(block.weights(self.use_adjacency))
        } else if let Some(block) = self.links.get(&(target, source)) {
            Ok(block.weights_rev(self.use_adjacency))
        } else {
            Err(ModelError::InvalidConfig(format!(
                "layers {source} and {target} are not connected"
            )))
        }
    }

    /// Initialize all unit and link parameters, visible layers from data
    /// statistics when a dataset is given.
    pub fn initialize(
        &mut self,
        dataset: Option<&dyn Dataset>,
        init: &InitConfig,
        rng: &mut StdRng,
    ) -> ModelResult<()> {
        let data = dataset.map(|d| d.all().0);
        for layer in &mut self.layers {
            let layer_data = match (&data, layer.visible) {
                (Some(d), true) if d.ncols() == layer.len() => Some(d.view()),
                _ => None,
            };
            layer.initialize(layer_data.as_ref(), init);
        }
        for block in self.links.values_mut() {
            let source_visible = self.layers[block.source].visible;
            let source_len = self.layers[block.source].len();
            let source_data = match (&data, source_visible) {
                (Some(d), true) if d.ncols() == source_len => Some(d.view()),
                _ => None,
            };
            block.initialize(source_data.as_ref(), init, rng);
        }
        self.check_shapes()
    }

    /// One expectation step: propagate `data` from the source layer into the
    /// target layer's expectation.
    pub fn expect_step(
        &self,
        data: &Array2<f64>,
        source: usize,
        target: usize,
    ) -> ModelResult<Array2<f64>> {
        let w = self.weights_between(source, target)?;
        Ok(self.layers[target].expect_given(&data.dot(&w)))
    }

    /// Layer-by-layer expectation propagation along a mapping.
    pub fn expect(&self, data: &Array2<f64>, mapping: &[usize]) -> ModelResult<Array2<f64>> {
        let mut values = data.clone();
        for pair in mapping.windows(2) {
            values = self.expect_step(&values, pair[0], pair[1])?;
        }
        Ok(values)
    }

    /// Expectation propagation retaining every intermediate activation
    /// (forward-pass support).
    pub fn expect_all(&self, data: &Array2<f64>, mapping: &[usize]) -> ModelResult<Vec<Array2<f64>>> {
        let mut values = vec![data.clone()];
        for pair in mapping.windows(2) {
            let next = self.expect_step(&values[values.len() - 1], pair[0], pair[1])?;
            values.push(next);
        }
        Ok(values)
    }

    /// Expectation propagation with the final layer collapsed to its median
    /// value (hard threshold for Bernoulli units).
    pub fn values(&self, data: &Array2<f64>, mapping: &[usize]) -> ModelResult<Array2<f64>> {
        let out = self.expect(data, mapping)?;
        match mapping.last() {
            Some(&last) => Ok(self.layers[last].value(&out)),
            None => Ok(out),
        }
    }

    /// Sampling chain along a mapping: each layer's state is sampled from
    /// its expectation before propagating to the next layer. With
    /// `expect_last`, the final layer keeps the expectation instead of a
    /// fresh sample, reducing gradient noise in contrastive-divergence
    /// chains. A single-layer mapping just samples that layer.
    pub fn samples(
        &self,
        data: &Array2<f64>,
        mapping: &[usize],
        expect_last: bool,
        rng: &mut StdRng,
    ) -> ModelResult<Array2<f64>> {
        if mapping.len() <= 1 {
            return Ok(match mapping.first() {
                Some(&idx) => self.layers[idx].sample(data, rng),
                None => data.clone(),
            });
        }
        let mut values = data.clone();
        for pair in mapping.windows(2) {
            let sampled = self.layers[pair[0]].sample(&values, rng);
            values = self.expect_step(&sampled, pair[0], pair[1])?;
        }
        if !expect_last {
            if let Some(&last) = mapping.last() {
                values = self.layers[last].sample(&values, rng);
            }
        }
        Ok(values)
    }

    /// Evaluate an objective against input/target data, propagating along
    /// the system's own mapping.
    pub fn evaluate(
        &self,
        objective: Objective,
        input: &Array2<f64>,
        target: &Array2<f64>,
    ) -> ModelResult<f64> {
        match objective {
            Objective::Error => {
                let out = self.expect(input, &self.mapping)?;
                let resid = &out - target;
                Ok((&resid * &resid).mean().unwrap_or(0.0))
            }
            Objective::Accuracy => {
                let out = self.expect(input, &self.mapping)?;
                let resid = &out - target;
                let dev = target - &column_means(&target.view());
                let norm = (&dev * &dev).sum() + f64::EPSILON;
                Ok(1.0 - ((&resid * &resid).sum() / norm).sqrt())
            }
            Objective::Energy => self.pseudo_energy(input),
        }
    }

    /// Pseudo-energy of the system: per-sample unit and link energies summed
    /// along the mapping, collapsed to `ln(1 + sum(exp(-E)))`.
    fn pseudo_energy(&self, input: &Array2<f64>) -> ModelResult<f64> {
        let values = self.expect_all(input, &self.mapping)?;
        let mut acc = Array1::<f64>::zeros(input.nrows());
        for (pos, &idx) in self.mapping.iter().enumerate() {
            acc += &self.layers[idx].sample_energy(&values[pos]);
        }
        for (pos, pair) in self.mapping.windows(2).enumerate() {
            let (s, t) = (pair[0], pair[1]);
            let block = self
                .links
                .get(&(s, t))
                .or_else(|| self.links.get(&(t, s)));
            if let Some(block) = block {
                let (sdata, tdata) = if block.source == s {
                    (&values[pos], &values[pos + 1])
                } else {
                    (&values[pos + 1], &values[pos])
                };
                acc += &block.energy(sdata, tdata, self.use_adjacency);
            }
        }
        Ok((1.0 + acc.mapv(|e| (-e).exp()).sum()).ln())
    }

    /// Remove the named units from a layer, compacting the layer and every
    /// incident link block in one call so shapes never disagree.
    pub fn remove_units(&mut self, layer: &str, drop_labels: &[String]) -> ModelResult<()> {
        let idx = self.layer_index(layer)?;
        let keep: Vec<usize> = self.layers[idx]
            .labels
            .iter()
            .enumerate()
            .filter(|(_, label)| !drop_labels.contains(label))
            .map(|(i, _)| i)
            .collect();
        self.layers[idx].retain(&keep);
        for block in self.links.values_mut() {
            if block.source == idx {
                block.retain_source(&keep);
            }
            if block.target == idx {
                block.retain_target(&keep);
            }
        }
        self.check_shapes()
    }

    /// Prune every link block at the given cutoff, then verify that the
    /// adjacency shapes still match both endpoint layers. Returns the total
    /// number of pruned connections.
    pub fn prune_links(&mut self, threshold: f64) -> ModelResult<usize> {
        let mut pruned = 0;
        for block in self.links.values_mut() {
            pruned += block.prune(threshold);
        }
        self.check_shapes()?;
        Ok(pruned)
    }

    /// Verify every store invariant: `len(bias) == len(labels)` per layer,
    /// `A.shape == W.shape == (n_src, n_tgt)` per link block.
    pub fn check_shapes(&self) -> ModelResult<()> {
        for layer in &self.layers {
            if layer.bias.len() != layer.labels.len() {
                return Err(ModelError::ShapeMismatch(format!(
                    "layer '{}': {} bias entries for {} labels",
                    layer.name,
                    layer.bias.len(),
                    layer.labels.len()
                )));
            }
            if layer.class == UnitClass::Gauss && layer.lvar.len() != layer.labels.len() {
                return Err(ModelError::ShapeMismatch(format!(
                    "layer '{}': {} lvar entries for {} labels",
                    layer.name,
                    layer.lvar.len(),
                    layer.labels.len()
                )));
            }
        }
        for (&(s, t), block) in &self.links {
            let expected = (self.layers[s].len(), self.layers[t].len());
            if block.w.dim() != expected || block.a.dim() != expected {
                return Err(ModelError::ShapeMismatch(format!(
                    "link ({s}, {t}): W {:?} / A {:?} for layer sizes {:?}",
                    block.w.dim(),
                    block.a.dim(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Deep copy of all parameters.
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            layers: self.layers.clone(),
            links: self.links.values().cloned().collect(),
        }
    }

    /// Restore a snapshot into the live store.
    pub fn restore(&mut self, snapshot: &ParamSnapshot) {
        self.layers = snapshot.layers.clone();
        self.links = snapshot
            .links
            .iter()
            .cloned()
            .map(|block| ((block.source, block.target), block))
            .collect();
    }
}
