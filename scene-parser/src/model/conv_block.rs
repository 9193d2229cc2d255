use crate::common::*;

#[derive(Debug, Clone)]
pub struct ConvBlockInit {
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub s: usize,
    pub batch_norm: bool,
}

impl ConvBlockInit {
    pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
            batch_norm: true,
        }
    }

    pub fn build<'p, P>(self, path: P) -> ConvBlock
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            out_c,
            k,
            s,
            batch_norm,
        } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c as i64,
            k as i64,
            nn::ConvConfig {
                stride: s as i64,
                padding: (k / 2) as i64,
                bias: !batch_norm,
                ..Default::default()
            },
        );
        let bn = batch_norm.then(|| nn::batch_norm2d(path / "bn", out_c as i64, Default::default()));

        ConvBlock { conv, bn }
    }
}

/// Convolution followed by optional batch normalization and leaky ReLU.
#[derive(Debug)]
pub struct ConvBlock {
    conv: nn::Conv2D,
    bn: Option<nn::BatchNorm>,
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply(&self.conv);
        let xs = match &self.bn {
            Some(bn) => xs.apply_t(bn, train),
            None => xs,
        };
        xs.leaky_relu()
    }
}
