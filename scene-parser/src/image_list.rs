use crate::common::*;

/// A batch of images zero-padded to a common size.
#[derive(Debug, TensorLike)]
pub struct ImageList {
    /// The padded images in `[batch, channel, height, width]` shape.
    pub tensors: Tensor,
    /// The size `[height, width]` of each image before padding.
    #[tensor_like(clone)]
    pub image_sizes: Vec<[usize; 2]>,
}

impl ImageList {
    /// Pad images in `[channel, height, width]` shape to the largest height and width,
    /// rounded up to a multiple of `size_divisibility` when it is non-zero.
    pub fn from_tensors(images: &[Tensor], size_divisibility: usize) -> Result<Self> {
        ensure!(!images.is_empty(), "cannot batch an empty list of images");

        let shapes: Vec<_> = images
            .iter()
            .map(|image| match image.size().as_slice() {
                &[c, h, w] => Ok((c, h, w)),
                shape => bail!("expect [c, h, w] image, but get shape {:?}", shape),
            })
            .try_collect()?;

        let channels = shapes[0].0;
        ensure!(
            shapes.iter().all(|&(c, _, _)| c == channels),
            "images must have the same number of channels"
        );

        let round_up = |size: i64| -> i64 {
            if size_divisibility > 0 {
                let div = size_divisibility as i64;
                (size + div - 1) / div * div
            } else {
                size
            }
        };
        let max_h = round_up(shapes.iter().map(|&(_, h, _)| h).max().unwrap_or(0));
        let max_w = round_up(shapes.iter().map(|&(_, _, w)| w).max().unwrap_or(0));

        let device = images[0].device();
        let tensors = Tensor::zeros(
            &[images.len() as i64, channels, max_h, max_w],
            (Kind::Float, device),
        );

        tch::no_grad(|| {
            for (index, (image, &(_c, h, w))) in izip!(images, &shapes).enumerate() {
                let _ = tensors
                    .i(index as i64)
                    .narrow(1, 0, h)
                    .narrow(2, 0, w)
                    .copy_(&image.to_kind(Kind::Float));
            }
        });

        let image_sizes = shapes
            .iter()
            .map(|&(_c, h, w)| [h as usize, w as usize])
            .collect();

        Ok(Self {
            tensors,
            image_sizes,
        })
    }

    pub fn len(&self) -> usize {
        self.image_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_to_size_divisibility() -> Result<()> {
        let images = vec![
            Tensor::ones(&[3, 20, 30], (Kind::Float, Device::Cpu)),
            Tensor::ones(&[3, 33, 10], (Kind::Float, Device::Cpu)),
        ];
        let list = ImageList::from_tensors(&images, 16)?;

        assert_eq!(list.tensors.size(), vec![2, 3, 48, 32]);
        assert_eq!(list.image_sizes, vec![[20, 30], [33, 10]]);

        // padded area stays zero
        let sum = f64::from(&list.tensors.i(0).sum(Kind::Double));
        assert_eq!(sum, (3 * 20 * 30) as f64);
        Ok(())
    }

    #[test]
    fn reject_mismatched_channels() {
        let images = vec![
            Tensor::ones(&[3, 4, 4], (Kind::Float, Device::Cpu)),
            Tensor::ones(&[1, 4, 4], (Kind::Float, Device::Cpu)),
        ];
        assert!(ImageList::from_tensors(&images, 0).is_err());
    }
}
