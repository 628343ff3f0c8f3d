use std::sync::Arc;

use ortmodule_rs::backend::ReferenceBackend;
use ortmodule_tests::define_wrapper_tests;

define_wrapper_tests!(reference_backend, || Arc::new(ReferenceBackend::new()));
