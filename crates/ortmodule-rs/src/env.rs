use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static ACCELERATOR_COUNT: OnceLock<usize> = OnceLock::new();
static DEFAULT_ACCELERATOR: OnceLock<usize> = OnceLock::new();
static SAVE_PLANS_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();

const DEFAULT_ACCELERATOR_COUNT: usize = 1;

fn parse_usize(name: &str, value: &str, fallback: usize) -> usize {
    match value.trim().parse::<usize>() {
        Ok(parsed) => parsed,
        Err(_) => {
            log::warn!("ignoring {name}={value:?}: expected a non-negative integer");
            fallback
        }
    }
}

fn usize_var(name: &str, fallback: usize) -> usize {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_usize(name, &value, fallback),
        _ => fallback,
    }
}

/// Number of simulated accelerator devices (`ORTMODULE_ACCELERATOR_COUNT`).
pub(crate) fn accelerator_count() -> usize {
    *ACCELERATOR_COUNT
        .get_or_init(|| usize_var("ORTMODULE_ACCELERATOR_COUNT", DEFAULT_ACCELERATOR_COUNT))
}

/// Accelerator index that a bare `cuda` resolves to (`ORTMODULE_DEFAULT_ACCELERATOR`).
pub(crate) fn default_accelerator() -> usize {
    *DEFAULT_ACCELERATOR.get_or_init(|| usize_var("ORTMODULE_DEFAULT_ACCELERATOR", 0))
}

/// Directory that receives exported programs as JSON (`ORTMODULE_SAVE_PLANS`).
pub(crate) fn save_plans_dir() -> Option<PathBuf> {
    SAVE_PLANS_DIR
        .get_or_init(|| match env::var("ORTMODULE_SAVE_PLANS") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .clone()
}
