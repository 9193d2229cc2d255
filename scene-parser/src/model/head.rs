use super::{ConvBlock, ConvBlockInit};
use crate::common::*;

/// The dense prediction head.
///
/// Each feature map cell predicts one objectness logit, four box parameters and
/// one logit per foreground class.
#[derive(Debug)]
pub struct DenseHead {
    conv: ConvBlock,
    pred: nn::Conv2D,
    num_fg_classes: usize,
}

/// Raw head outputs on a `[batch, height, width]` grid.
#[derive(Debug, TensorLike)]
pub struct DenseOutput {
    /// Objectness logits in `[b, h, w]`.
    pub obj: Tensor,
    /// Box parameters in `[b, 4, h, w]`: cell offsets `(dy, dx)` before sigmoid and
    /// log-scale sizes `(log h, log w)` in stride units.
    pub bbox: Tensor,
    /// Classification logits in `[b, c, h, w]`.
    pub class: Tensor,
}

impl DenseOutput {
    /// The grid size in `(height, width)`.
    pub fn grid_size(&self) -> (i64, i64) {
        let size = self.obj.size();
        (size[1], size[2])
    }
}

impl DenseHead {
    pub fn new<'p, P>(path: P, in_c: usize, num_fg_classes: usize) -> Result<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        ensure!(num_fg_classes > 0, "at least one foreground class is required");

        let conv = ConvBlockInit::new(in_c, in_c, 3).build(path / "conv");
        let pred = nn::conv2d(
            path / "pred",
            in_c as i64,
            (5 + num_fg_classes) as i64,
            1,
            Default::default(),
        );

        Ok(Self {
            conv,
            pred,
            num_fg_classes,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> DenseOutput {
        let xs = self.conv.forward_t(xs, train).apply(&self.pred);
        let num_fg = self.num_fg_classes as i64;

        let obj = xs.narrow(1, 0, 1).squeeze_dim(1);
        let bbox = xs.narrow(1, 1, 4);
        let class = xs.narrow(1, 5, num_fg);

        DenseOutput { obj, bbox, class }
    }
}
