//! Position encodings for the Perceiver.
//!
//! Two families are supported: a trainable lookup table over flattened
//! spatial indices, and deterministic Fourier features of continuous
//! coordinates in [-1, 1]^d. Both report their output width as a pure
//! function of their parameters so that consuming modules can size their
//! projections at construction time.

use candle_core::{Device, Tensor, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::core::{PerceiverError, Result};

/// Evenly spaced values from `start` to `end` inclusive
pub(crate) fn linspace(start: f32, end: f32, steps: usize, device: &Device) -> Result<Tensor> {
    if steps == 0 {
        return Err(PerceiverError::config("linspace requires at least 1 step"));
    }
    if steps == 1 {
        return Ok(Tensor::from_vec(vec![start], 1, device)?);
    }
    let step = (end - start) as f64 / (steps - 1) as f64;
    let t = Tensor::arange(0f32, steps as f32, device)?.affine(step, start as f64)?;
    Ok(t)
}

/// Dense linear grid over every index axis, flattened in row-major order.
///
/// Returns a `[prod(index_dims), d]` tensor of coordinates in [-1, 1]^d,
/// matching the token ordering of a row-major flattened input sequence.
pub fn build_linear_positions(index_dims: &[usize], device: &Device) -> Result<Tensor> {
    if index_dims.is_empty() {
        return Err(PerceiverError::config(
            "cannot build positions for an empty index space",
        ));
    }
    let d = index_dims.len();
    let mut columns = Vec::with_capacity(d);
    for (axis, &n) in index_dims.iter().enumerate() {
        let mut shape = vec![1usize; d];
        shape[axis] = n;
        let col = linspace(-1.0, 1.0, n, device)?
            .reshape(shape)?
            .broadcast_as(index_dims)?
            .flatten_all()?;
        columns.push(col);
    }
    Ok(Tensor::stack(&columns, 1)?)
}

/// Fourier features of n points in d-dimensional space.
///
/// `pos` is `[batch, n, d]` with coordinates in [-1, 1]. For every axis,
/// `num_bands` frequencies are linearly spaced from 1 to resolution/2 and
/// the features are sin(pi f x) plus, unless `sine_only`, cos(pi f x),
/// concatenated across bands and axes. `concat_pos` prepends the raw
/// coordinates.
pub fn generate_fourier_features(
    pos: &Tensor,
    num_bands: usize,
    max_resolution: &[usize],
    concat_pos: bool,
    sine_only: bool,
) -> Result<Tensor> {
    let (batch_size, num_points, num_dims) = pos.dims3()?;
    if num_dims != max_resolution.len() {
        return Err(PerceiverError::shape_mismatch(
            "fourier position input",
            format!("{} coordinate axes", max_resolution.len()),
            format!("{}", num_dims),
        ));
    }
    let device = pos.device();

    // Frequencies run from 1 to the Nyquist frequency of each axis.
    let mut bands = Vec::with_capacity(num_dims);
    for &res in max_resolution {
        bands.push(linspace(1.0, res as f32 / 2.0, num_bands, device)?);
    }
    let freq_bands = Tensor::stack(&bands, 0)?; // [d, num_bands]

    let per_pos = pos
        .unsqueeze(D::Minus1)?
        .broadcast_mul(&freq_bands.unsqueeze(0)?.unsqueeze(0)?)?
        .reshape((batch_size, num_points, num_dims * num_bands))?;

    let scaled = per_pos.affine(std::f64::consts::PI, 0.0)?;
    let features = if sine_only {
        scaled.sin()?
    } else {
        Tensor::cat(&[scaled.sin()?, scaled.cos()?], D::Minus1)?
    };

    if concat_pos {
        Ok(Tensor::cat(&[pos.clone(), features], D::Minus1)?)
    } else {
        Ok(features)
    }
}

/// Learned per-position feature table over a flattened index space
#[derive(Debug, Clone)]
pub struct TrainablePositionEncoding {
    position_embeddings: Tensor,
    index_dims: Vec<usize>,
    num_channels: usize,
}

impl TrainablePositionEncoding {
    pub fn new(
        index_dims: Vec<usize>,
        num_channels: usize,
        initializer_range: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if index_dims.is_empty() || num_channels == 0 {
            return Err(PerceiverError::config(
                "trainable position encoding needs index_dims and num_channels",
            ));
        }
        let index_dim: usize = index_dims.iter().product();
        let position_embeddings = vb.get_with_hints(
            (index_dim, num_channels),
            "position_embeddings",
            Init::Randn {
                mean: 0.0,
                stdev: initializer_range,
            },
        )?;
        Ok(Self {
            position_embeddings,
            index_dims,
            num_channels,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.index_dims.len()
    }

    pub fn output_size(&self) -> usize {
        self.num_channels
    }

    /// Full table broadcast across the batch: `[batch, prod(index_dims), c]`
    pub fn forward(&self, batch_size: usize) -> Result<Tensor> {
        let (n, c) = self.position_embeddings.dims2()?;
        Ok(self
            .position_embeddings
            .unsqueeze(0)?
            .broadcast_as((batch_size, n, c))?
            .contiguous()?)
    }

    /// Table rows at the given flat indices, broadcast across the batch
    pub fn select(&self, indices: &[usize], batch_size: usize) -> Result<Tensor> {
        let device = self.position_embeddings.device();
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), device)?;
        let rows = self.position_embeddings.index_select(&idx, 0)?;
        let (n, c) = rows.dims2()?;
        Ok(rows
            .unsqueeze(0)?
            .broadcast_as((batch_size, n, c))?
            .contiguous()?)
    }
}

/// Deterministic sinusoidal features of spatial coordinates
#[derive(Debug, Clone)]
pub struct FourierPositionEncoding {
    num_bands: usize,
    max_resolution: Vec<usize>,
    concat_pos: bool,
    sine_only: bool,
}

impl FourierPositionEncoding {
    pub fn new(
        num_bands: usize,
        max_resolution: Vec<usize>,
        concat_pos: bool,
        sine_only: bool,
    ) -> Result<Self> {
        if num_bands == 0 || max_resolution.is_empty() {
            return Err(PerceiverError::config(
                "fourier position encoding needs num_bands and max_resolution",
            ));
        }
        Ok(Self {
            num_bands,
            max_resolution,
            concat_pos,
            sine_only,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.max_resolution.len()
    }

    /// Output width as a closed-form function of the parameters
    pub fn output_size(&self) -> usize {
        let num_dims = self.max_resolution.len();
        let mut encoding_size = self.num_bands * num_dims;
        if !self.sine_only {
            encoding_size *= 2;
        }
        if self.concat_pos {
            encoding_size += num_dims;
        }
        encoding_size
    }

    /// Features over the dense grid of `index_dims`, or over explicitly
    /// supplied positions `[batch, n, d]`
    pub fn forward(
        &self,
        index_dims: &[usize],
        batch_size: usize,
        device: &Device,
        pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let pos = match pos {
            Some(p) => p.clone(),
            None => {
                let grid = build_linear_positions(index_dims, device)?;
                let (n, d) = grid.dims2()?;
                grid.unsqueeze(0)?
                    .broadcast_as((batch_size, n, d))?
                    .contiguous()?
            }
        };
        generate_fourier_features(
            &pos,
            self.num_bands,
            &self.max_resolution,
            self.concat_pos,
            self.sine_only,
        )
    }
}

/// Closed set of position-encoding kinds
#[derive(Debug, Clone)]
pub enum PositionEncoding {
    Trainable(TrainablePositionEncoding),
    Fourier(FourierPositionEncoding),
}

impl PositionEncoding {
    pub fn num_dimensions(&self) -> usize {
        match self {
            PositionEncoding::Trainable(enc) => enc.num_dimensions(),
            PositionEncoding::Fourier(enc) => enc.num_dimensions(),
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            PositionEncoding::Trainable(enc) => enc.output_size(),
            PositionEncoding::Fourier(enc) => enc.output_size(),
        }
    }
}

/// Declarative choice of position encoding
#[derive(Debug, Clone)]
pub enum PositionEncodingConfig {
    Trainable {
        index_dims: Vec<usize>,
        num_channels: usize,
    },
    Fourier {
        num_bands: usize,
        max_resolution: Vec<usize>,
        concat_pos: bool,
        sine_only: bool,
    },
    /// No position encoding; queries must be constructed elsewhere
    None,
}

impl PositionEncodingConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, PositionEncodingConfig::None)
    }
}

/// Builds the position encoding plus its optional linear projection.
///
/// Returns `(encoding, projection)`; both are `None` for the `None` kind.
pub fn build_position_encoding(
    config: &PositionEncodingConfig,
    project_pos_dim: Option<usize>,
    initializer_range: f64,
    vb: VarBuilder,
) -> Result<(Option<PositionEncoding>, Option<Linear>)> {
    let encoding = match config {
        PositionEncodingConfig::Trainable {
            index_dims,
            num_channels,
        } => PositionEncoding::Trainable(TrainablePositionEncoding::new(
            index_dims.clone(),
            *num_channels,
            initializer_range,
            vb.clone(),
        )?),
        PositionEncodingConfig::Fourier {
            num_bands,
            max_resolution,
            concat_pos,
            sine_only,
        } => PositionEncoding::Fourier(FourierPositionEncoding::new(
            *num_bands,
            max_resolution.clone(),
            *concat_pos,
            *sine_only,
        )?),
        PositionEncodingConfig::None => return Ok((None, None)),
    };

    let projection = match project_pos_dim {
        Some(dim) if dim > 0 => Some(linear(
            encoding.output_size(),
            dim,
            vb.pp("positions_projection"),
        )?),
        _ => None,
    };
    Ok((Some(encoding), projection))
}

/// Applies the optional projection to a position encoding tensor
pub(crate) fn project_positions(projection: Option<&Linear>, pos: &Tensor) -> Result<Tensor> {
    match projection {
        Some(proj) => Ok(proj.forward(pos)?),
        None => Ok(pos.clone()),
    }
}

/// Reports the effective width after the optional projection
pub(crate) fn projected_size(encoding: &PositionEncoding, project_pos_dim: Option<usize>) -> usize {
    match project_pos_dim {
        Some(dim) if dim > 0 => dim,
        _ => encoding.output_size(),
    }
}
