//! # capsule-store
//!
//! Append-only SQLite audit store for the Capsule runtime.
//!
//! One database file holds every run: metadata, the verbatim plan and
//! policy, every tool call with its arguments, every result with input and
//! output hashes, and (in agent mode) every planner proposal. Stored rows
//! are never modified, which is what makes replay and after-the-fact hash
//! verification possible.

pub mod store;

pub use store::{CapsuleStore, VerifyReport};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use capsule_contracts::{
        hash_json, CallStatus, Plan, Policy, PolicyDecision, ProposalType, RunMode, RunStatus,
        StepCounts,
    };

    use super::*;

    fn sample_plan() -> Plan {
        Plan::from_yaml("steps:\n  - tool: fs.read\n    args: {path: ./README.md}\n").unwrap()
    }

    fn sample_policy() -> Policy {
        Policy::from_yaml("tools:\n  fs.read:\n    allow_paths: [\"./**\"]\n").unwrap()
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn create_run_stores_hashes_and_verbatim_documents() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let plan = sample_plan();
        let policy = sample_policy();

        let run_id = store.create_run(&plan, &policy, RunMode::Run).unwrap();
        assert_eq!(run_id.len(), 8);

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.mode, RunMode::Run);
        assert_eq!(run.total_steps, 1);
        assert_eq!(run.plan_hash, plan.hash().unwrap());
        assert_eq!(run.policy_hash, policy.hash().unwrap());

        assert_eq!(store.get_run_plan(&run_id).unwrap().unwrap(), plan);
        assert_eq!(store.get_run_policy(&run_id).unwrap().unwrap(), policy);
    }

    #[test]
    fn missing_run_reads_as_none() {
        let store = CapsuleStore::open_in_memory().unwrap();
        assert!(store.get_run("deadbeef").unwrap().is_none());
        assert!(store.get_run_plan("deadbeef").unwrap().is_none());
    }

    #[test]
    fn call_and_result_round_trip_with_hashes() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();

        let call_args = args(json!({"path": "./README.md", "encoding": "utf-8"}));
        let call_id = store.record_call(&run_id, 0, "fs.read", &call_args).unwrap();

        let output = json!({"content": "hello", "size_bytes": 5});
        let started = Utc::now();
        store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Success,
                Some(&output),
                None,
                &PolicyDecision::allow("path allowed", "allow_paths[./**]"),
                started,
                Utc::now(),
            )
            .unwrap();

        let calls = store.get_calls(&run_id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "fs.read");
        assert_eq!(calls[0].args, call_args);

        let results = store.get_results(&run_id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CallStatus::Success);
        assert_eq!(results[0].output.as_ref().unwrap(), &output);

        // Round-trip hash invariant: stored hashes equal recomputation
        // over canonical JSON of what was stored.
        assert_eq!(
            results[0].input_hash,
            hash_json(&serde_json::Value::Object(call_args))
        );
        assert_eq!(results[0].output_hash, hash_json(&output));
    }

    #[test]
    fn denied_result_has_empty_output_hash() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();
        let call_id = store
            .record_call(&run_id, 0, "fs.read", &args(json!({"path": "./.env"})))
            .unwrap();
        store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Denied,
                None,
                Some("denied by policy: hidden files not allowed"),
                &PolicyDecision::deny("hidden files not allowed: ./.env", "allow_hidden=false"),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        let result = store.get_result_for_call(&call_id).unwrap().unwrap();
        assert_eq!(result.output_hash, "");
        assert!(!result.decision.allowed);
    }

    /// Exactly one result per call: the second insert must be rejected.
    #[test]
    fn second_result_for_a_call_is_rejected() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();
        let call_id = store
            .record_call(&run_id, 0, "fs.read", &args(json!({"path": "./a"})))
            .unwrap();
        let decision = PolicyDecision::allow("ok", "allow_paths[./**]");

        store
            .record_result(&call_id, &run_id, CallStatus::Success, None, None, &decision, Utc::now(), Utc::now())
            .unwrap();
        let err = store
            .record_result(&call_id, &run_id, CallStatus::Error, None, Some("again"), &decision, Utc::now(), Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("already has a result"));
    }

    #[test]
    fn result_without_a_call_is_rejected() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();
        let err = store
            .record_result(
                "nocall00",
                &run_id,
                CallStatus::Success,
                None,
                None,
                &PolicyDecision::allow("ok", "x"),
                Utc::now(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("no tool_calls row"));
    }

    #[test]
    fn status_transitions_are_enforced() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();

        store.update_run_status(&run_id, RunStatus::Running, StepCounts::default()).unwrap();
        store
            .update_run_status(
                &run_id,
                RunStatus::Completed,
                StepCounts { completed: 1, denied: 0, failed: 0 },
            )
            .unwrap();

        // Regressions are storage errors.
        let err = store
            .update_run_status(&run_id, RunStatus::Running, StepCounts::default())
            .unwrap_err();
        assert_eq!(err.code(), 5000);

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.completed_steps, 1);
    }

    #[test]
    fn proposals_are_logged_in_iteration_order() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Agent).unwrap();

        store
            .record_proposal(
                &run_id,
                0,
                ProposalType::ToolCall,
                Some("fs.read"),
                Some(r#"{"path":"./a"}"#),
                Some("need the file contents"),
                r#"{"tool":"fs.read","args":{"path":"./a"}}"#,
            )
            .unwrap();
        // Unparseable output still lands with its raw bytes.
        store
            .record_proposal(&run_id, 1, ProposalType::Done, None, None, None, "i am done<<<garbage")
            .unwrap();

        let proposals = store.get_proposals(&run_id).unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].proposal_type, ProposalType::ToolCall);
        assert_eq!(proposals[0].tool_name.as_deref(), Some("fs.read"));
        assert_eq!(proposals[1].raw_response, "i am done<<<garbage");
    }

    #[test]
    fn verify_run_passes_on_untouched_data_and_flags_missing_results() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();
        let call_id = store
            .record_call(&run_id, 0, "fs.read", &args(json!({"path": "./a"})))
            .unwrap();
        store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Success,
                Some(&json!({"content": "x"})),
                None,
                &PolicyDecision::allow("ok", "allow_paths[./**]"),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        let report = store.verify_run(&run_id).unwrap();
        assert!(report.ok, "unexpected mismatches: {:?}", report.mismatches);

        // A call without a result (crashed run) is a verification finding.
        store.record_call(&run_id, 1, "fs.read", &args(json!({"path": "./b"}))).unwrap();
        let report = store.verify_run(&run_id).unwrap();
        assert!(!report.ok);
        assert!(report.mismatches.iter().any(|m| m.contains("missing result")));
    }

    #[test]
    fn verify_run_errors_on_unknown_run() {
        let store = CapsuleStore::open_in_memory().unwrap();
        assert!(matches!(
            store.verify_run("deadbeef"),
            Err(capsule_contracts::CapsuleError::RunNotFound { .. })
        ));
    }

    #[test]
    fn database_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("capsule.db");

        let run_id = {
            let store = CapsuleStore::open(&db_path).unwrap();
            store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap()
        };

        let store = CapsuleStore::open(&db_path).unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.run_id, run_id);
        assert_eq!(store.list_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn run_summary_joins_calls_and_results() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let run_id = store.create_run(&sample_plan(), &sample_policy(), RunMode::Run).unwrap();
        let call_id = store
            .record_call(&run_id, 0, "fs.read", &args(json!({"path": "./a"})))
            .unwrap();
        store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Success,
                Some(&json!({"content": "x"})),
                None,
                &PolicyDecision::allow("ok", "allow_paths[./**]"),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        let summary = store.run_summary(&run_id).unwrap().unwrap();
        assert_eq!(summary["run_id"], run_id);
        assert_eq!(summary["steps"][0]["tool"], "fs.read");
        assert_eq!(summary["steps"][0]["status"], "success");
        assert_eq!(summary["steps"][0]["allowed"], true);
        assert!(store.run_summary("deadbeef").unwrap().is_none());
    }
}
