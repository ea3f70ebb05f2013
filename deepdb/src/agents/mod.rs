//! Model-backed pipeline stages.

pub mod model_stage;
pub mod research;
pub mod sql;

use model_stage::StageSpec;

/// Every generative stage, in pipeline order.
pub fn all_stages() -> impl Iterator<Item = StageSpec> {
    sql::STAGES.into_iter().chain(research::STAGES)
}

/// Look up a stage by name.
pub fn find_stage(name: &str) -> Option<StageSpec> {
    all_stages().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::prompt::PromptEngine;
    use std::collections::BTreeSet;

    #[test]
    fn stage_names_are_unique_and_match_templates() {
        let names: BTreeSet<&str> = all_stages().map(|spec| spec.name).collect();
        assert_eq!(names.len(), 10);
        let templates: BTreeSet<&str> = PromptEngine::template_names().collect();
        for spec in all_stages() {
            assert!(templates.contains(spec.template), "{}", spec.template);
        }
    }

    #[test]
    fn stages_never_write_seed_keys() {
        for spec in all_stages() {
            assert!(!spec.output_key.is_seed(), "{}", spec.name);
        }
    }

    #[test]
    fn templates_read_their_required_keys() {
        let engine = PromptEngine::new(60_000).expect("engine");
        for spec in all_stages() {
            let referenced = engine.referenced_keys(spec.template).expect("keys");
            for key in spec.required {
                let via_current_query = matches!(
                    key,
                    crate::core::state::StateKey::QueryGenerationOutput
                );
                assert!(
                    referenced.contains(key) || via_current_query,
                    "{} does not read {key}",
                    spec.template
                );
            }
        }
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(
            find_stage("report_revision").map(|spec| spec.output_key),
            Some(crate::core::state::StateKey::FinalRevisedReport)
        );
        assert!(find_stage("decomposer").is_none());
    }
}
