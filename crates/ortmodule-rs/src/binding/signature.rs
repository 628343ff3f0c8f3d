use std::collections::HashSet;

use anyhow::Result;

use super::args::CallArgs;
use super::bound::{BoundInput, BoundInputs};
use crate::error::WrapperError;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    PositionalOrKeyword,
    /// Collects every extra positional argument (`*args`).
    VarPositional,
    KeywordOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputParam {
    name: String,
    kind: InputKind,
    optional: bool,
}

impl InputParam {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Whether the parameter defaults to `None` when not supplied.
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Ordered input declaration of a model's forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    params: Vec<InputParam>,
}

fn binding_error(message: impl Into<String>) -> anyhow::Error {
    WrapperError::binding(message).into()
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: InputKind, optional: bool) -> Self {
        self.params.push(InputParam {
            name: name.into(),
            kind,
            optional,
        });
        self
    }

    /// Required positional-or-keyword input.
    pub fn positional(self, name: impl Into<String>) -> Self {
        self.push(name, InputKind::PositionalOrKeyword, false)
    }

    /// Positional-or-keyword input defaulting to `None`.
    pub fn optional(self, name: impl Into<String>) -> Self {
        self.push(name, InputKind::PositionalOrKeyword, true)
    }

    pub fn var_positional(self, name: impl Into<String>) -> Self {
        self.push(name, InputKind::VarPositional, true)
    }

    pub fn keyword(self, name: impl Into<String>) -> Self {
        self.push(name, InputKind::KeywordOnly, false)
    }

    pub fn keyword_optional(self, name: impl Into<String>) -> Self {
        self.push(name, InputKind::KeywordOnly, true)
    }

    pub fn params(&self) -> &[InputParam] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|param| param.name == name)
    }

    /// Checks that the declaration is one a call could be bound against.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut saw_variadic = false;
        let mut saw_keyword_only = false;
        let mut saw_optional_positional = false;
        for param in &self.params {
            let name = param.name.as_str();
            if name.is_empty() {
                return Err(binding_error("input names must be non-empty"));
            }
            if !seen.insert(name) {
                return Err(binding_error(format!("duplicate input name '{name}'")));
            }
            match param.kind {
                InputKind::PositionalOrKeyword => {
                    if saw_variadic || saw_keyword_only {
                        return Err(binding_error(format!(
                            "positional input '{name}' must precede variadic and keyword-only inputs"
                        )));
                    }
                    if saw_optional_positional && !param.optional {
                        return Err(binding_error(format!(
                            "required input '{name}' follows an input with a default"
                        )));
                    }
                    saw_optional_positional |= param.optional;
                }
                InputKind::VarPositional => {
                    if saw_variadic {
                        return Err(binding_error(format!(
                            "only one variadic input is allowed, found a second one '{name}'"
                        )));
                    }
                    if saw_keyword_only {
                        return Err(binding_error(format!(
                            "variadic input '{name}' must precede keyword-only inputs"
                        )));
                    }
                    saw_variadic = true;
                }
                InputKind::KeywordOnly => saw_keyword_only = true,
            }
        }
        Ok(())
    }

    /// Binds call arguments to the declared inputs.
    ///
    /// Positional values fill positional-or-keyword inputs in order and spill into the
    /// variadic input; keywords bind by name. Variadic values are flattened as `<name>_<i>`.
    pub fn bind(&self, args: CallArgs) -> Result<BoundInputs> {
        self.validate()?;
        let CallArgs {
            positional,
            keyword,
        } = args;

        let mut slots: Vec<Option<Option<Tensor>>> = vec![None; self.params.len()];
        let mut variadic: Vec<Option<Tensor>> = Vec::new();

        let mut positional = positional.into_iter();
        let positional_slots: Vec<usize> = self
            .params
            .iter()
            .enumerate()
            .filter(|(_, param)| param.kind == InputKind::PositionalOrKeyword)
            .map(|(idx, _)| idx)
            .collect();
        for &idx in &positional_slots {
            match positional.next() {
                Some(value) => slots[idx] = Some(value),
                None => break,
            }
        }
        let extra: Vec<Option<Tensor>> = positional.collect();
        if !extra.is_empty() {
            if self
                .params
                .iter()
                .any(|param| param.kind == InputKind::VarPositional)
            {
                variadic = extra;
            } else {
                return Err(binding_error(format!(
                    "too many positional arguments: forward() takes {} but {} were given",
                    positional_slots.len(),
                    positional_slots.len() + extra.len()
                )));
            }
        }

        for (name, value) in keyword {
            let idx = self
                .position(&name)
                .ok_or_else(|| binding_error(format!("unexpected keyword argument '{name}'")))?;
            if self.params[idx].kind == InputKind::VarPositional {
                return Err(binding_error(format!(
                    "variadic input '{name}' cannot be passed by keyword"
                )));
            }
            if slots[idx].is_some() {
                return Err(binding_error(format!(
                    "multiple values for argument '{name}'"
                )));
            }
            slots[idx] = Some(value);
        }

        let mut entries = Vec::with_capacity(self.params.len() + variadic.len());
        for (param, slot) in self.params.iter().zip(slots) {
            if param.kind == InputKind::VarPositional {
                for (i, value) in variadic.drain(..).enumerate() {
                    entries.push(BoundInput {
                        name: format!("{}_{i}", param.name),
                        param: param.name.clone(),
                        tensor: value,
                    });
                }
                continue;
            }
            let tensor = match slot {
                Some(value) => value,
                None if param.optional => None,
                None => {
                    return Err(binding_error(format!(
                        "missing required argument '{}'",
                        param.name
                    )))
                }
            };
            entries.push(BoundInput {
                name: param.name.clone(),
                param: param.name.clone(),
                tensor,
            });
        }
        Ok(BoundInputs::from_entries(entries))
    }
}
