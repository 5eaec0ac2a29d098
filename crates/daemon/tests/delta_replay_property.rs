use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use slotsync_common::mutation::{apply_versioned, StateMutation};
use slotsync_common::types::{
    ChatMessage, DirectoryEntry, FileWatcherStats, JobInfo, PaneTab, QueuedMessages, ToolExecution,
    WorkspaceState,
};
use slotsync_daemon::engine::{DeltaRange, StateStoreError, VersionedStateStore};
use slotsync_daemon::store::{PersistenceStore, SnapshotPolicy};

const WORKSPACE: &str = "ws-prop";
const SLOT_POOL: usize = 4;
const DIR_POOL: usize = 3;

#[derive(Debug, Clone)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        self.state >> 11
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() as usize) % upper_exclusive
    }

    fn coin(&mut self) -> bool {
        self.next_usize(2) == 0
    }
}

fn slot_id(rng: &mut Lcg) -> String {
    format!("slot-{}", rng.next_usize(SLOT_POOL))
}

fn dir_path(rng: &mut Lcg) -> String {
    format!("/repo/dir-{}", rng.next_usize(DIR_POOL))
}

fn message(rng: &mut Lcg, step: usize) -> ChatMessage {
    ChatMessage {
        id: format!("m-{step}-{}", rng.next_usize(1_000)),
        role: if rng.coin() { "user" } else { "assistant" }.into(),
        content: json!({ "text": format!("step {step}") }),
        timestamp: rng.coin().then(|| 1_700_000_000_000 + step as i64),
    }
}

/// A random mutation for `WORKSPACE`. Slot and directory ids come from small
/// pools so duplicate creates and unknown-slot updates happen regularly.
fn random_mutation(rng: &mut Lcg, step: usize) -> StateMutation {
    let workspace_id = WORKSPACE.to_string();
    match rng.next_usize(16) {
        0 => StateMutation::WorkspaceCreate { workspace_id, path: format!("/repo/{}", rng.next_usize(3)) },
        1 if rng.next_usize(4) == 0 => StateMutation::WorkspaceClose { workspace_id },
        1 | 2 => StateMutation::SlotCreate { workspace_id, slot_id: slot_id(rng) },
        3 => StateMutation::SlotDelete { workspace_id, slot_id: slot_id(rng) },
        4 => StateMutation::SlotUpdate {
            workspace_id,
            slot_id: slot_id(rng),
            is_streaming: rng.coin().then(|| rng.coin()),
            is_compacting: rng.coin().then(|| rng.coin()),
            messages: rng.coin().then(|| vec![message(rng, step)]),
        },
        5 | 6 => StateMutation::MessagesAppend {
            workspace_id,
            slot_id: slot_id(rng),
            messages: (0..1 + rng.next_usize(3)).map(|_| message(rng, step)).collect(),
        },
        7 => StateMutation::ToolExecutionStart {
            workspace_id,
            slot_id: slot_id(rng),
            execution: ToolExecution {
                tool_call_id: format!("call-{}", rng.next_usize(3)),
                tool_name: "bash".into(),
                args: json!({ "step": step }),
                started_at: Some(step as i64),
            },
        },
        8 => StateMutation::ToolExecutionEnd {
            workspace_id,
            slot_id: slot_id(rng),
            tool_call_id: format!("call-{}", rng.next_usize(3)),
        },
        9 => StateMutation::QueuedMessagesUpdate {
            workspace_id,
            slot_id: slot_id(rng),
            queued_messages: QueuedMessages {
                steering: vec![format!("steer {step}")],
                follow_up: Vec::new(),
            },
        },
        10 => StateMutation::PendingUiSet {
            workspace_id,
            slot_id: slot_id(rng),
            pending_ui: rng.coin().then(|| json!({ "kind": "confirm", "step": step })),
        },
        11 => StateMutation::ActiveJobsUpdate {
            workspace_id,
            active_jobs: vec![JobInfo {
                id: format!("job-{step}"),
                title: "build".into(),
                status: "running".into(),
                path: None,
            }],
        },
        12 => StateMutation::WorkspaceUiUpdate {
            workspace_id,
            pane_tabs: vec![PaneTab {
                id: "tab-1".into(),
                slot_id: Some(slot_id(rng)),
                title: format!("tab {step}"),
                active: rng.coin(),
            }],
        },
        13 => {
            if rng.coin() {
                StateMutation::WatchedDirectoryAdd { workspace_id, path: dir_path(rng) }
            } else {
                StateMutation::WatchedDirectoryRemove { workspace_id, path: dir_path(rng) }
            }
        }
        14 => {
            let path = dir_path(rng);
            StateMutation::DirectoryEntriesUpdate {
                workspace_id,
                entries: vec![DirectoryEntry {
                    name: format!("file-{step}.rs"),
                    path: format!("{path}/file-{step}.rs"),
                    is_directory: false,
                    size: Some(step as u64),
                    modified_at: None,
                }],
                path,
                updated_at: Some(step as i64),
            }
        }
        _ => {
            if rng.coin() {
                StateMutation::FileWatcherStatsUpdate {
                    workspace_id,
                    stats: FileWatcherStats { scans: step as u64, ..FileWatcherStats::default() },
                }
            } else {
                StateMutation::DirectoryWatchError {
                    workspace_id,
                    path: dir_path(rng),
                    error: "permission denied".into(),
                }
            }
        }
    }
}

fn replay(mut state: Option<WorkspaceState>, since: u64, deltas: &[StateMutation]) -> Option<WorkspaceState> {
    for (offset, mutation) in deltas.iter().enumerate() {
        apply_versioned(&mut state, mutation, since + offset as u64 + 1)
            .unwrap_or_else(|error| panic!("delta at {} failed to replay: {error}", since + offset as u64 + 1));
    }
    state
}

fn run_replay_check(seed: u64, ops: usize, snapshot_every: u64) -> Option<u64> {
    let persistence =
        Arc::new(PersistenceStore::open_in_memory().expect("in-memory store should open"));
    let policy = SnapshotPolicy {
        interval_mutations: snapshot_every,
        interval: Duration::from_secs(24 * 60 * 60),
    };
    let store = VersionedStateStore::new(Arc::clone(&persistence), policy);
    let mut rng = Lcg::new(seed);

    store
        .mutate(WORKSPACE, StateMutation::WorkspaceCreate { workspace_id: WORKSPACE.into(), path: "/repo/0".into() })
        .expect("initial create should apply");
    // history[v] is the committed state at version v.
    let mut history: Vec<Option<WorkspaceState>> =
        vec![None, store.get_workspace_state(WORKSPACE).map(|state| (*state).clone())];

    for step in 0..ops {
        let mutation = random_mutation(&mut rng, step);
        let before = store.current_version(WORKSPACE);
        match store.mutate(WORKSPACE, mutation) {
            Ok(version) => {
                assert_eq!(version, before + 1, "seed={seed} step={step}: versions must be dense");
                history.push(store.get_workspace_state(WORKSPACE).map(|state| (*state).clone()));
            }
            Err(StateStoreError::Rejected(_)) => {
                assert_eq!(
                    store.current_version(WORKSPACE),
                    before,
                    "seed={seed} step={step}: rejected mutation must not bump the version"
                );
            }
            Err(error) => panic!("seed={seed} step={step}: unexpected error {error}"),
        }
    }

    let current = store.current_version(WORKSPACE);
    assert_eq!(current as usize, history.len() - 1);
    let expected = store.get_workspace_state(WORKSPACE).map(|state| (*state).clone());

    for since in 0..=current {
        let deltas = match store.get_delta_since(WORKSPACE, since).expect("delta query should succeed") {
            DeltaRange::Available(deltas) => deltas,
            DeltaRange::Unavailable => panic!("seed={seed}: deltas since {since} should be retained"),
        };
        assert_eq!(deltas.len() as u64, current - since);
        let replayed = replay(history[since as usize].clone(), since, &deltas);
        assert_eq!(replayed, expected, "seed={seed}: replay from {since} diverged");
    }

    // The log holds exactly one delta per version, each chained to the previous.
    let persisted = persistence.deltas_since(WORKSPACE, 0).expect("persisted deltas should load");
    let versions: Vec<u64> = persisted.iter().map(|delta| delta.version).collect();
    assert_eq!(versions, (1..=current).collect::<Vec<_>>(), "seed={seed}: persisted versions");
    for delta in &persisted {
        assert_eq!(delta.base_version, delta.version - 1, "seed={seed}: delta v{}", delta.version);
    }

    // The newest snapshot decodes to exactly the live state at its version.
    let snapshot_version =
        persistence.latest_snapshot(WORKSPACE).expect("snapshot query should succeed").map(|snapshot| {
            let decoded = snapshot.decode_state().expect("snapshot should decode");
            assert_eq!(
                Some(decoded),
                history[snapshot.version as usize],
                "seed={seed}: snapshot at v{} diverged",
                snapshot.version
            );
            snapshot.version
        });

    // A cold start from the same persistence rebuilds the same state.
    let (recovered, report) =
        VersionedStateStore::recover(persistence, policy).expect("recovery should succeed");
    assert!(report.degraded_workspaces.is_empty(), "seed={seed}: recovery degraded");
    assert_eq!(recovered.current_version(WORKSPACE), current);
    assert_eq!(recovered.get_workspace_state(WORKSPACE).map(|state| (*state).clone()), expected);
    snapshot_version
}

#[test]
fn replay_matches_live_state_for_fixed_seed() {
    let snapshot_version = run_replay_check(0x5107_5bc0, 400, 25);
    assert!(snapshot_version.is_some(), "400 versions at an interval of 25 should snapshot");
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn replaying_any_suffix_reproduces_current_state(
        seed in any::<u64>(),
        ops in 1usize..160,
        snapshot_every in 0u64..40,
    ) {
        let _ = run_replay_check(seed, ops, snapshot_every);
    }
}
