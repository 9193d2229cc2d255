use super::{ConvBlock, ConvBlockInit};
use crate::common::*;

/// A plain strided convolutional feature extractor.
///
/// Each stage halves the spatial size, so the output stride is `2^stages`.
#[derive(Debug)]
pub struct Backbone {
    stages: Vec<(ConvBlock, ConvBlock)>,
    out_c: usize,
}

impl Backbone {
    pub fn new<'p, P>(path: P, in_c: usize, channels: &[usize]) -> Result<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        ensure!(!channels.is_empty(), "backbone must have at least one stage");

        let mut prev_c = in_c;
        let stages = channels
            .iter()
            .enumerate()
            .map(|(index, &out_c)| {
                let stage_path = path / format!("stage_{}", index);
                let down = ConvBlockInit {
                    s: 2,
                    ..ConvBlockInit::new(prev_c, out_c, 3)
                }
                .build(&stage_path / "down");
                let conv = ConvBlockInit::new(out_c, out_c, 3).build(&stage_path / "conv");
                prev_c = out_c;
                (down, conv)
            })
            .collect();

        Ok(Self {
            stages,
            out_c: prev_c,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_c
    }
}

impl ModuleT for Backbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.stages
            .iter()
            .fold(xs.shallow_clone(), |xs, (down, conv)| {
                let xs = down.forward_t(&xs, train);
                conv.forward_t(&xs, train)
            })
    }
}
