use crate::tensor::Tensor;

/// Arguments of one model call. `None` stands for an explicitly omitted optional input.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub(crate) positional: Vec<Option<Tensor>>,
    pub(crate) keyword: Vec<(String, Option<Tensor>)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional arguments in order.
    pub fn from_tensors<I, T>(tensors: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tensor>,
    {
        CallArgs {
            positional: tensors.into_iter().map(|t| Some(t.into())).collect(),
            keyword: Vec::new(),
        }
    }

    pub fn arg(mut self, tensor: impl Into<Tensor>) -> Self {
        self.positional.push(Some(tensor.into()));
        self
    }

    /// Positional `None`.
    pub fn none(mut self) -> Self {
        self.positional.push(None);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, tensor: impl Into<Tensor>) -> Self {
        self.keyword.push((name.into(), Some(tensor.into())));
        self
    }

    pub fn kwarg_none(mut self, name: impl Into<String>) -> Self {
        self.keyword.push((name.into(), None));
        self
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    pub fn keyword_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.keyword.iter().map(|(name, _)| name.as_str())
    }
}

impl From<Tensor> for CallArgs {
    fn from(tensor: Tensor) -> Self {
        CallArgs::new().arg(tensor)
    }
}

impl From<&Tensor> for CallArgs {
    fn from(tensor: &Tensor) -> Self {
        CallArgs::new().arg(tensor)
    }
}
