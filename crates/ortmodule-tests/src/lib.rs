pub mod api;
pub mod common;
pub mod models;
pub mod recording_backend;

pub type Result<T> = anyhow::Result<T>;

/// Instantiates the wrapper contract suite for one backend.
///
/// `$backend_ctor` is called once per test and must return an `Arc` of the backend.
#[macro_export]
macro_rules! define_wrapper_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::api;

            macro_rules! contract_test {
                ($test:ident) => {
                    #[test]
                    fn $test() -> $crate::Result<()> {
                        let backend = ($backend_ctor)();
                        api::$test(&backend)
                    }
                };
            }

            contract_test!(forward_call_single_positional_argument);
            contract_test!(forward_call_multiple_positional_arguments);
            contract_test!(forward_call_positional_arguments);
            contract_test!(forward_call_keyword_arguments);
            contract_test!(forward_call_positional_and_keyword_arguments);
            contract_test!(binding_errors_reach_the_caller);
            contract_test!(model_cuda);
            contract_test!(model_cpu);
            contract_test!(model_to_device);
            contract_test!(model_to_device_and_back_to_original);
            contract_test!(model_with_different_devices_same_session);
            contract_test!(input_requires_grad_saved);
            contract_test!(input_requires_grad_backward_creates_input_grad);
            contract_test!(backward_crosses_devices);
            contract_test!(changes_input_requires_grad_rebuilds_plan);
            contract_test!(plan_is_stable_for_value_changes);
            contract_test!(export_runs_without_grad);
            contract_test!(detached_values_follow_each_call);
            contract_test!(constants_built_in_forward_match_eager);
            contract_test!(new_leaf_inside_forward_fails_export);
            contract_test!(forward_under_no_grad_keeps_grad_requirements);
            contract_test!(model_without_parameters);
            contract_test!(model_without_trainable_parameters);
            contract_test!(custom_model_without_trainable_parameters);
            contract_test!(model_with_unused_trainable_parameters);
            contract_test!(frozen_model_executes);
            contract_test!(model_with_multiple_devices);
            contract_test!(model_with_different_cuda_devices);
            contract_test!(unavailable_device_leaves_wrapper_untouched);
            contract_test!(parameterless_model_binds_device_from_inputs);
        }
    };
}
