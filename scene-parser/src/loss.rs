use crate::common::*;

/// Named scalar losses in insertion order.
#[derive(Debug, Default)]
pub struct LossDict {
    losses: IndexMap<Cow<'static, str>, Tensor>,
}

impl LossDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S>(&mut self, name: S, loss: Tensor)
    where
        S: Into<Cow<'static, str>>,
    {
        self.losses.insert(name.into(), loss);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.losses.get(name)
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.losses.iter().map(|(name, loss)| (name.as_ref(), loss))
    }

    /// The sum of all losses. It is a zero scalar if the dictionary is empty.
    pub fn total(&self) -> Tensor {
        let mut iter = self.losses.values();
        match iter.next() {
            Some(first) => iter.fold(first.shallow_clone(), |sum, loss| sum + loss),
            None => Tensor::from(0f32),
        }
    }

    /// Detached scalar values for logging.
    pub fn to_scalars(&self) -> Vec<(String, f64)> {
        self.losses
            .iter()
            .map(|(name, loss)| (name.to_string(), f64::from(&loss.detach())))
            .collect()
    }
}

impl Clone for LossDict {
    fn clone(&self) -> Self {
        let losses = self
            .losses
            .iter()
            .map(|(name, loss)| (name.clone(), loss.shallow_clone()))
            .collect();
        Self { losses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn total_sums_all_losses() {
        let mut dict = LossDict::new();
        dict.insert("loss_a", Tensor::from(1.5f32));
        dict.insert("loss_b", Tensor::from(2.0f32));
        dict.insert("loss_c", Tensor::from(0.25f32));

        let total = f64::from(&dict.total());
        assert!(abs_diff_eq!(total, 3.75));

        let names: Vec<_> = dict.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, vec!["loss_a", "loss_b", "loss_c"]);
    }

    #[test]
    fn empty_dict_sums_to_zero() {
        let dict = LossDict::new();
        assert_eq!(f64::from(&dict.total()), 0.0);
    }
}
