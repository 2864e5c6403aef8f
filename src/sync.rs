//! Sync merge engine
//!
//! Merges one incoming client batch against a user's append-only
//! transaction log. The client reports the last sync key it knows; the log
//! index of that key is the branch point separating shared history from
//! history the client has not seen. Tasks the server has not touched since
//! the branch point are stored verbatim; tasks modified on both sides are
//! three-way merged onto their common ancestor, interleaving the two
//! modification sequences by last-modification time.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::repository::{Repository, User};
use crate::task::Task;

/// The nil key a client reports on its very first sync.
pub const NIL_KEY: &str = "00000000-0000-0000-0000-000000000000";

/// Outcome of one sync request.
#[derive(Debug)]
pub struct SyncResult {
    pub code: &'static str,
    pub payload: String,
    pub store_count: usize,
    pub merge_count: usize,
}

/// Run the merge engine for one authenticated request payload.
///
/// The caller must hold the user's exclusive lock: the read, merge and
/// append below assume the log cannot move underneath them.
pub fn execute(repo: &Repository, user: &User, payload: &str) -> Result<SyncResult> {
    let (client_key, client_tasks) = parse_client_batch(payload)?;
    let log = repo.read(user)?;

    let branch_point = find_branch_point(&log, client_key.as_deref())?;
    let subset = extract_subset(&log, branch_point)?;

    let mut new_server_data: Vec<String> = Vec::new();
    let mut new_client_data: Vec<String> = Vec::new();
    let mut already_seen: Vec<String> = Vec::new();
    let mut store_count = 0usize;
    let mut merge_count = 0usize;

    for task in &client_tasks {
        let uuid = task.uuid().to_string();

        if subset.iter().any(|candidate| candidate.uuid() == uuid) {
            // Merging scans the whole log for this uuid and picks up every
            // incoming snapshot of it, so later duplicates are skipped.
            if already_seen.contains(&uuid) {
                continue;
            }
            already_seen.push(uuid.clone());

            let ancestor = find_common_ancestor(&log, branch_point, &uuid)?;
            debug!(%uuid, ancestor, "common ancestor");

            let client_mods = client_mods(&client_tasks, &uuid);
            let server_mods = server_mods(&log, &uuid, ancestor)?;

            let mut combined = Task::parse(&log[ancestor])
                .map_err(|err| Error::TaskParse(format!("ancestor record: {err}")))?;
            merge_mods(&client_mods, &server_mods, &mut combined);

            let combined_json = combined.compose_json();
            new_server_data.push(combined_json.clone());
            new_client_data.push(combined_json);
            merge_count += 1;
        } else {
            // Not touched on the server since the branch point: store
            // unmodified, nothing to return to the client.
            new_server_data.push(task.compose_json());
            store_count += 1;
        }
    }

    info!(store_count, merge_count, "sync processed");

    // New server data means a new sync key; otherwise the most recent key
    // in the log is still valid.
    let has_new_data = !new_server_data.is_empty();
    let sync_key = if has_new_data {
        let key = Uuid::new_v4().to_string();
        info!(sync_key = %key, "new sync key");
        new_server_data.push(key.clone());
        repo.append(user, &new_server_data)?;
        key
    } else {
        let key = log
            .iter()
            .rev()
            .find(|line| !line.starts_with('{'))
            .cloned()
            .unwrap_or_default();
        debug!(sync_key = %key, "sync key still valid");
        key
    };

    let mut response_payload = String::new();
    if !subset.is_empty() || !new_client_data.is_empty() {
        for task in &subset {
            response_payload.push_str(&task.compose_json());
            response_payload.push('\n');
        }
        for line in &new_client_data {
            response_payload.push_str(line);
            response_payload.push('\n');
        }
    }
    response_payload.push_str(&sync_key);
    response_payload.push('\n');

    let code = if !subset.is_empty() || !new_client_data.is_empty() || has_new_data {
        "200"
    } else {
        "201"
    };

    Ok(SyncResult {
        code,
        payload: response_payload,
        store_count,
        merge_count,
    })
}

/// Split the request payload into the client's sync key and its task
/// snapshots, in arrival order.
fn parse_client_batch(payload: &str) -> Result<(Option<String>, Vec<Task>)> {
    let mut key = None;
    let mut tasks = Vec::new();

    for line in payload.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            let task = Task::parse(line)
                .map_err(|err| Error::Malformed(format!("client task: {err}")))?;
            if task.uuid().is_empty() {
                return Err(Error::Malformed("client task has no uuid".into()));
            }
            tasks.push(task);
        } else {
            Uuid::parse_str(line)
                .map_err(|err| Error::Malformed(format!("client sync key {line:?}: {err}")))?;
            key = Some(line.to_string());
        }
    }

    Ok((key, tasks))
}

/// Locate the client's key in the log. A missing key is either a
/// first-time sync or a request for all data.
fn find_branch_point(log: &[String], key: Option<&str>) -> Result<usize> {
    let key = match key {
        None | Some("") | Some(NIL_KEY) => return Ok(0),
        Some(key) => key,
    };

    match log.iter().position(|line| line == key) {
        Some(idx) => {
            debug!(%key, branch_point = idx, "branch point");
            Ok(idx)
        }
        None => {
            info!(%key, "branch point not found");
            Err(Error::DesyncedClient)
        }
    }
}

/// Every task record at or after the branch point: the post-branch
/// modifications the client does not yet know about.
fn extract_subset(log: &[String], branch_point: usize) -> Result<Vec<Task>> {
    if branch_point > log.len() {
        return Err(Error::Repository(format!(
            "invalid branch point {branch_point} for log of {} lines",
            log.len()
        )));
    }

    let mut tasks = Vec::new();
    for line in &log[branch_point..] {
        if line.starts_with('{') {
            tasks.push(
                Task::parse(line).map_err(|err| Error::TaskParse(format!("log record: {err}")))?,
            );
        }
    }
    Ok(tasks)
}

/// Walk the log backwards from the branch point for the most recent
/// snapshot of `uuid`: the pre-branch state both sides modified.
fn find_common_ancestor(log: &[String], branch_point: usize, uuid: &str) -> Result<usize> {
    if log.is_empty() {
        return Err(Error::DesyncedClient);
    }

    let top = branch_point.min(log.len() - 1);
    for idx in (0..=top).rev() {
        if !log[idx].starts_with('{') {
            continue;
        }
        let task = Task::parse(&log[idx])
            .map_err(|err| Error::TaskParse(format!("log record: {err}")))?;
        if task.uuid() == uuid {
            return Ok(idx);
        }
    }

    Err(Error::DesyncedClient)
}

/// The incoming snapshots of `uuid`, in arrival order.
fn client_mods(tasks: &[Task], uuid: &str) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| task.uuid() == uuid)
        .cloned()
        .collect()
}

/// The server-side snapshots of `uuid` strictly after the common
/// ancestor, in log order.
fn server_mods(log: &[String], uuid: &str, ancestor: usize) -> Result<Vec<Task>> {
    let mut mods = Vec::new();
    for line in &log[ancestor + 1..] {
        if !line.starts_with('{') {
            continue;
        }
        let task =
            Task::parse(line).map_err(|err| Error::TaskParse(format!("log record: {err}")))?;
        if task.uuid() == uuid {
            mods.push(task);
        }
    }
    Ok(mods)
}

/// Walk the client (`left`) and server (`right`) modification sequences
/// simultaneously, applying whichever side's next snapshot has the earlier
/// last-modification time. On a tie the client side is applied first, so
/// the server-side patch lands last and its values win.
fn merge_mods(left: &[Task], right: &[Task], combined: &mut Task) {
    let ancestor = combined.clone();
    let mut prev_left = &ancestor;
    let mut prev_right = &ancestor;
    let mut l = 0;
    let mut r = 0;

    while l < left.len() && r < right.len() {
        let mod_left = last_modification(&left[l]);
        let mod_right = last_modification(&right[r]);
        if mod_left <= mod_right {
            debug!(mod_left, mod_right, "applying left");
            patch(combined, prev_left, &left[l]);
            combined.set_date("modified", mod_left);
            prev_left = &left[l];
            l += 1;
        } else {
            debug!(mod_left, mod_right, "applying right");
            patch(combined, prev_right, &right[r]);
            combined.set_date("modified", mod_right);
            prev_right = &right[r];
            r += 1;
        }
    }

    while l < left.len() {
        patch(combined, prev_left, &left[l]);
        combined.set_date("modified", last_modification(&left[l]));
        prev_left = &left[l];
        l += 1;
    }

    while r < right.len() {
        patch(combined, prev_right, &right[r]);
        combined.set_date("modified", last_modification(&right[r]));
        prev_right = &right[r];
        r += 1;
    }
}

/// The last modification time of a task. Ideally the `modified`
/// attribute; pre-2.2.0 clients omit it, so fall through `end` and
/// `start` before settling on `entry`.
fn last_modification(task: &Task) -> i64 {
    for field in ["modified", "end", "start"] {
        if task.has(field) {
            return task.get_date(field);
        }
    }
    task.get_date("entry")
}

/// Determine the delta between `from` and `to`, and apply only those
/// changes to `base`. All three tasks share a uuid.
fn patch(base: &mut Task, from: &Task, to: &Task) {
    let from_attrs = from.attr_names();
    let to_attrs = to.attr_names();

    // Attributes dropped between from and to are deleted from base.
    for name in &from_attrs {
        if !to_attrs.contains(name) {
            debug!(attribute = %name, "patch remove");
            base.remove(name);
        }
    }

    // Attributes introduced by to are added to base.
    for name in &to_attrs {
        if !from_attrs.contains(name) {
            debug!(attribute = %name, "patch add");
            base.set(*name, to.get(name));
        }
    }

    // Attributes present on both sides are applied when the values differ.
    for name in &to_attrs {
        if from_attrs.contains(name) && from.get(name) != to.get(name) {
            debug!(attribute = %name, "patch modify");
            base.set(*name, to.get(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(pairs: &[(&str, &str)]) -> Task {
        let mut task = Task::default();
        for (name, value) in pairs {
            task.set(*name, *value);
        }
        task
    }

    #[test]
    fn branch_point_nil_and_empty_keys_mean_first_sync() {
        let log = vec!["{\"uuid\":\"1\"}".to_string(), "some-key".to_string()];
        assert_eq!(find_branch_point(&log, None).unwrap(), 0);
        assert_eq!(find_branch_point(&log, Some("")).unwrap(), 0);
        assert_eq!(find_branch_point(&log, Some(NIL_KEY)).unwrap(), 0);
    }

    #[test]
    fn branch_point_is_the_exact_key_line() {
        let log = vec![
            "{\"uuid\":\"1\"}".to_string(),
            "key-a".to_string(),
            "{\"uuid\":\"2\"}".to_string(),
            "key-b".to_string(),
        ];
        assert_eq!(find_branch_point(&log, Some("key-a")).unwrap(), 1);
        assert_eq!(find_branch_point(&log, Some("key-b")).unwrap(), 3);
        assert!(matches!(
            find_branch_point(&log, Some("never-issued")),
            Err(Error::DesyncedClient)
        ));
    }

    #[test]
    fn subset_collects_task_lines_after_the_branch() {
        let log = vec![
            "{\"uuid\":\"1\"}".to_string(),
            "key-a".to_string(),
            "{\"uuid\":\"2\"}".to_string(),
            "{\"uuid\":\"3\"}".to_string(),
            "key-b".to_string(),
        ];
        let subset = extract_subset(&log, 1).unwrap();
        assert_eq!(subset.len(), 2);
        assert_eq!(subset[0].uuid(), "2");
        assert_eq!(subset[1].uuid(), "3");

        assert!(extract_subset(&log, 6).is_err());
    }

    #[test]
    fn common_ancestor_is_the_most_recent_before_the_branch() {
        let log = vec![
            "{\"uuid\":\"1\",\"description\":\"old\"}".to_string(),
            "key-a".to_string(),
            "{\"uuid\":\"1\",\"description\":\"newer\"}".to_string(),
            "key-b".to_string(),
            "{\"uuid\":\"1\",\"description\":\"post-branch\"}".to_string(),
        ];
        assert_eq!(find_common_ancestor(&log, 3, "1").unwrap(), 2);
        assert!(matches!(
            find_common_ancestor(&log, 3, "unknown"),
            Err(Error::DesyncedClient)
        ));
    }

    #[test]
    fn patch_with_identical_sides_is_identity() {
        let mut base = task(&[("uuid", "1"), ("description", "base"), ("project", "home")]);
        let expected = base.clone();
        let side = task(&[("uuid", "1"), ("description", "side")]);

        patch(&mut base, &side, &side);
        assert_eq!(base, expected);
    }

    #[test]
    fn patch_applies_adds_removes_and_modifies() {
        let mut base = task(&[("uuid", "1"), ("priority", "L"), ("project", "home")]);
        let from = task(&[("uuid", "1"), ("priority", "L"), ("due", "100")]);
        let to = task(&[("uuid", "1"), ("priority", "H"), ("tags", "next")]);

        patch(&mut base, &from, &to);

        // `due` was dropped between from and to; removed from base.
        assert!(!base.has("due"));
        // `tags` was introduced by to.
        assert_eq!(base.get("tags"), "next");
        // `priority` differs; to wins.
        assert_eq!(base.get("priority"), "H");
        // `project` only lives in base; untouched.
        assert_eq!(base.get("project"), "home");
    }

    #[test]
    fn last_modification_prefers_modified_then_end_then_start() {
        assert_eq!(
            last_modification(&task(&[("modified", "5"), ("end", "4"), ("entry", "1")])),
            5
        );
        assert_eq!(
            last_modification(&task(&[("end", "4"), ("start", "3"), ("entry", "1")])),
            4
        );
        assert_eq!(last_modification(&task(&[("start", "3"), ("entry", "1")])), 3);
        assert_eq!(last_modification(&task(&[("entry", "1")])), 1);
    }

    #[test]
    fn merge_tie_break_favors_the_server_side() {
        let mut combined = task(&[("uuid", "1"), ("entry", "1")]);
        let left = vec![task(&[("uuid", "1"), ("modified", "10"), ("tags", "A")])];
        let right = vec![task(&[("uuid", "1"), ("modified", "10"), ("tags", "B")])];

        merge_mods(&left, &right, &mut combined);
        assert_eq!(combined.get("tags"), "B");
        assert_eq!(combined.get_date("modified"), 10);
    }

    #[test]
    fn merge_interleaves_by_modification_time() {
        // Client annotates at t=10, server sets a due date at t=20; the
        // merged task carries both and modified lands on the later patch.
        let mut combined = task(&[("uuid", "1"), ("entry", "1")]);
        let left = vec![task(&[
            ("uuid", "1"),
            ("entry", "1"),
            ("modified", "10"),
            ("annotation_10", "hi"),
        ])];
        let right = vec![task(&[
            ("uuid", "1"),
            ("entry", "1"),
            ("modified", "20"),
            ("due", "99"),
        ])];

        merge_mods(&left, &right, &mut combined);
        assert_eq!(combined.get("annotation_10"), "hi");
        assert_eq!(combined.get_date("due"), 99);
        assert_eq!(combined.get_date("modified"), 20);
    }

    #[test]
    fn merge_drains_the_longer_side() {
        let mut combined = task(&[("uuid", "1"), ("entry", "1")]);
        let left = vec![
            task(&[("uuid", "1"), ("modified", "10"), ("priority", "L")]),
            task(&[("uuid", "1"), ("modified", "30"), ("priority", "H")]),
        ];
        let right = vec![task(&[("uuid", "1"), ("modified", "20"), ("project", "work")])];

        merge_mods(&left, &right, &mut combined);
        assert_eq!(combined.get("priority"), "H");
        assert_eq!(combined.get("project"), "work");
        assert_eq!(combined.get_date("modified"), 30);
    }

    #[test]
    fn client_batch_rejects_garbage() {
        assert!(parse_client_batch("not-a-uuid\n").is_err());
        assert!(parse_client_batch("{\"description\":\"no uuid\"}\n").is_err());
        assert!(parse_client_batch(&format!("{NIL_KEY}\n{{\"uuid\":\"1\"")).is_err());

        let (key, tasks) =
            parse_client_batch(&format!("{NIL_KEY}\n{{\"uuid\":\"1\"}}\n\n")).unwrap();
        assert_eq!(key.as_deref(), Some(NIL_KEY));
        assert_eq!(tasks.len(), 1);
    }
}
