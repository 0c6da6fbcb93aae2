use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the query-based detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Number of classifier outputs, including the trailing no-object class.
    pub num_classes: usize,
    pub num_queries: usize,
    pub hidden_dim: usize,
    /// Channel widths of the strided convolution stages.
    pub backbone_channels: Vec<usize>,
    pub bbox_head_layers: usize,
    pub dropout_p: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl DetectorConfig {
    pub fn new(num_classes: usize, num_queries: usize, hidden_dim: usize, device: Device) -> Self {
        Self {
            num_classes,
            num_queries,
            hidden_dim,
            backbone_channels: vec![32, 64],
            bbox_head_layers: 3,
            dropout_p: Some(0.1),
            dtype: DType::F32,
            device,
        }
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::Msg(
                "num_classes must count at least one object class plus no-object".into(),
            ));
        }
        if self.num_queries == 0 {
            return Err(Error::Msg("num_queries must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.backbone_channels.iter().any(|&c| c == 0) {
            return Err(Error::Msg("backbone channel widths must be non-zero".into()));
        }
        if self.bbox_head_layers == 0 {
            return Err(Error::Msg("bbox_head_layers must be greater than zero".into()));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "detector parameters require a float dtype, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}
