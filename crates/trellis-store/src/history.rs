//! Append-only history for an axis, with cold entries folded into per-day
//! zip archives.
//!
//! Every overwrite of a current document first appends the superseded
//! document to `history/<axis>.<day>.txt`. Only today's and yesterday's
//! logs stay hot; anything older is folded into
//! `history/archive/<year>/<axis>.<day>.zip`, one archive per calendar day,
//! each holding a single member named like the log it came from. Folding
//! groups entries by the day in each entry's own timestamp, not by the name
//! of the log file, so entries written after midnight land on the day they
//! describe.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::document::StateDocument;
use crate::error::Result;

/// Directory under a thing holding hot history logs.
pub const HISTORY_DIR: &str = "history";
/// Directory under the history dir holding per-year archive folders.
pub const ARCHIVE_DIR: &str = "archive";
/// Days of hot logs kept unarchived: today and yesterday.
pub const HOT_RETENTION_DAYS: i64 = 2;

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Append a superseded document line to today's log for an axis. The first
/// append of a new calendar day folds every aged log of that axis first.
pub fn append(thing_dir: &Path, axis: &str, line: &str, today: NaiveDate) -> Result<()> {
    let history_dir = thing_dir.join(HISTORY_DIR);
    fs::create_dir_all(&history_dir)?;

    let log = history_dir.join(log_name(axis, today));
    if !log.exists() {
        fold_aged(thing_dir, axis, today)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&log)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Fold every log of an axis older than the hot retention window into the
/// archive. A failure on one log is logged and does not stop the others.
pub fn fold_aged(thing_dir: &Path, axis: &str, today: NaiveDate) -> Result<()> {
    let history_dir = thing_dir.join(HISTORY_DIR);
    if !history_dir.is_dir() {
        return Ok(());
    }
    let boundary = today - Duration::days(HOT_RETENTION_DAYS - 1);
    for entry in fs::read_dir(&history_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(day) = day_of_file(name, axis, "txt") {
            if day < boundary {
                if let Err(e) = fold_log(thing_dir, axis, &entry.path()) {
                    warn!("Could not fold {}: {}", entry.path().display(), e);
                }
            }
        }
    }
    Ok(())
}

/// Fold one log into per-day archives and delete it. Entries land in the
/// archive of the day their own timestamp names; malformed lines are
/// skipped with a warning rather than aborting the fold.
pub fn fold_log(thing_dir: &Path, axis: &str, log: &Path) -> Result<()> {
    let contents = fs::read_to_string(log)?;
    let mut days: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let document = match StateDocument::parse(line) {
            Ok(document) => document,
            Err(e) => {
                warn!(
                    "Skipping malformed history line in {}: {}",
                    log.display(),
                    e
                );
                continue;
            }
        };
        let taken_at = match document.timestamp() {
            Ok(taken_at) => taken_at,
            Err(e) => {
                warn!(
                    "Skipping history line with a bad timestamp in {}: {}",
                    log.display(),
                    e
                );
                continue;
            }
        };
        days.entry(taken_at.date_naive())
            .or_default()
            .push(line.to_string());
    }

    for (day, lines) in &days {
        archive_day(thing_dir, axis, *day, lines)?;
    }

    fs::remove_file(log)?;
    info!("Folded {} into the archive", log.display());
    Ok(())
}

/// Load every archived and hot entry for an axis going back `since_days`
/// from `now`. Entries are returned in file order; lines that no longer
/// parse are dropped. The caller merges the current document and sorts.
pub fn load(
    thing_dir: &Path,
    axis: &str,
    since_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<StateDocument>> {
    let cutoff = now - Duration::days(since_days);
    let mut documents = Vec::new();

    let archive_root = thing_dir.join(HISTORY_DIR).join(ARCHIVE_DIR);
    if archive_root.is_dir() {
        for year_entry in fs::read_dir(&archive_root)? {
            let year_entry = year_entry?;
            if !year_entry.path().is_dir() {
                continue;
            }
            let year: Option<i32> = year_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse().ok());
            match year {
                Some(year) if year >= cutoff.year() && year <= now.year() => {}
                _ => continue,
            }
            load_year(&year_entry.path(), axis, cutoff.date_naive(), &mut documents)?;
        }
    }

    let history_dir = thing_dir.join(HISTORY_DIR);
    if history_dir.is_dir() {
        for entry in fs::read_dir(&history_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if day_of_file(name, axis, "txt").is_none() {
                continue;
            }
            let contents = fs::read_to_string(entry.path())?;
            collect_documents(&contents, &mut documents);
        }
    }

    Ok(documents)
}

fn load_year(
    year_dir: &Path,
    axis: &str,
    cutoff_day: NaiveDate,
    documents: &mut Vec<StateDocument>,
) -> Result<()> {
    for entry in fs::read_dir(year_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let day = match day_of_file(name, axis, "zip") {
            Some(day) => day,
            None => continue,
        };
        if day < cutoff_day {
            continue;
        }
        match read_member(&entry.path(), &log_name(axis, day)) {
            Ok(contents) => collect_documents(&contents, documents),
            Err(e) => warn!("Could not read archive {}: {}", entry.path().display(), e),
        }
    }
    Ok(())
}

fn collect_documents(contents: &str, documents: &mut Vec<StateDocument>) {
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match StateDocument::parse(line) {
            Ok(document) => documents.push(document),
            Err(e) => debug!("Dropping unreadable history line: {}", e),
        }
    }
}

/// Merge lines into the archive for one day. Existing entries are kept and
/// duplicates dropped, so re-folding the same log is a no-op. The archive
/// is rebuilt beside itself and swapped in with a rename.
fn archive_day(thing_dir: &Path, axis: &str, day: NaiveDate, lines: &[String]) -> Result<()> {
    let year_dir = thing_dir
        .join(HISTORY_DIR)
        .join(ARCHIVE_DIR)
        .join(day.year().to_string());
    fs::create_dir_all(&year_dir)?;

    let archive = year_dir.join(zip_name(axis, day));
    let member = log_name(axis, day);

    let mut merged: Vec<String> = Vec::new();
    if archive.exists() {
        merged = read_member(&archive, &member)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect();
    }

    let mut seen: HashSet<String> = merged.iter().cloned().collect();
    let mut added = 0usize;
    for line in lines {
        if seen.insert(line.clone()) {
            merged.push(line.clone());
            added += 1;
        }
    }
    if archive.exists() && added == 0 {
        debug!("Archive {} already holds every entry", archive.display());
        return Ok(());
    }

    let staged = year_dir.join(format!(".{}.tmp", zip_name(axis, day)));
    write_member(&staged, &member, &merged)?;
    fs::rename(&staged, &archive)?;
    debug!("Archived {} entries into {}", added, archive.display());
    Ok(())
}

fn read_member(archive: &Path, member: &str) -> Result<String> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    let mut contents = String::new();
    match zip.by_name(member) {
        Ok(mut entry) => {
            entry.read_to_string(&mut contents)?;
        }
        Err(zip::result::ZipError::FileNotFound) => {
            debug!("Archive {} has no member {}", archive.display(), member);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(contents)
}

fn write_member(path: &Path, member: &str, lines: &[String]) -> Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(member, options)?;
    for line in lines {
        zip.write_all(line.as_bytes())?;
        zip.write_all(b"\n")?;
    }
    zip.finish()?;
    Ok(())
}

fn log_name(axis: &str, day: NaiveDate) -> String {
    format!("{}.{}.txt", axis, day.format(DAY_FORMAT))
}

fn zip_name(axis: &str, day: NaiveDate) -> String {
    format!("{}.{}.zip", axis, day.format(DAY_FORMAT))
}

/// Parse the day out of `<axis>.<YYYY-MM-DD>.<ext>`, for this axis only.
fn day_of_file(name: &str, axis: &str, ext: &str) -> Option<NaiveDate> {
    let day = name
        .strip_prefix(axis)?
        .strip_prefix('.')?
        .strip_suffix(ext)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::PathBuf;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn archive_path(thing_dir: &Path, axis: &str, archive_day: NaiveDate) -> PathBuf {
        thing_dir
            .join(HISTORY_DIR)
            .join(ARCHIVE_DIR)
            .join(archive_day.year().to_string())
            .join(zip_name(axis, archive_day))
    }

    fn line(value: i64, stamp: &str) -> String {
        StateDocument {
            state: json!({ "senses": { "I2C-9": value } }),
            timestamp_utc: stamp.to_string(),
        }
        .to_compact()
        .unwrap()
    }

    fn write_log(thing_dir: &Path, axis: &str, log_day: NaiveDate, lines: &[String]) {
        let dir = thing_dir.join(HISTORY_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(log_name(axis, log_day)), lines.join("\n") + "\n").unwrap();
    }

    fn archived_lines(thing_dir: &Path, axis: &str, archive_day: NaiveDate) -> Vec<String> {
        let path = archive_path(thing_dir, axis, archive_day);
        read_member(&path, &log_name(axis, archive_day))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn append_accumulates_lines_in_todays_log() {
        let dir = tempfile::tempdir().unwrap();
        let today = day(2024, 3, 10);
        append(dir.path(), "reported", &line(1, "2024-03-10 08:00:00"), today).unwrap();
        append(dir.path(), "reported", &line(2, "2024-03-10 09:00:00"), today).unwrap();

        let log = dir.path().join(HISTORY_DIR).join("reported.2024-03-10.txt");
        let contents = fs::read_to_string(log).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn first_append_of_a_new_day_folds_aged_logs() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 8),
            &[line(1, "2024-03-08 10:00:00")],
        );
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 9),
            &[line(2, "2024-03-09 10:00:00")],
        );

        let today = day(2024, 3, 10);
        append(dir.path(), "reported", &line(3, "2024-03-10 10:00:00"), today).unwrap();

        let history = dir.path().join(HISTORY_DIR);
        assert!(!history.join("reported.2024-03-08.txt").exists());
        // Yesterday's log is still inside the hot window.
        assert!(history.join("reported.2024-03-09.txt").exists());
        assert!(history.join("reported.2024-03-10.txt").exists());

        let archived = archived_lines(dir.path(), "reported", day(2024, 3, 8));
        assert_eq!(archived, vec![line(1, "2024-03-08 10:00:00")]);
    }

    #[test]
    fn refolding_the_same_entries_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![
            line(1, "2024-03-08 10:00:00"),
            line(2, "2024-03-08 11:00:00"),
        ];
        write_log(dir.path(), "reported", day(2024, 3, 8), &lines);
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();

        // The same log reappears, as after a partially replayed restore.
        write_log(dir.path(), "reported", day(2024, 3, 8), &lines);
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();

        assert_eq!(archived_lines(dir.path(), "reported", day(2024, 3, 8)), lines);
    }

    #[test]
    fn folding_groups_entries_by_their_own_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        // A log named for March 8 holding one entry that straddled midnight.
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 8),
            &[
                line(1, "2024-03-07 23:59:58"),
                line(2, "2024-03-08 00:00:03"),
            ],
        );
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();

        assert_eq!(
            archived_lines(dir.path(), "reported", day(2024, 3, 7)),
            vec![line(1, "2024-03-07 23:59:58")]
        );
        assert_eq!(
            archived_lines(dir.path(), "reported", day(2024, 3, 8)),
            vec![line(2, "2024-03-08 00:00:03")]
        );
    }

    #[test]
    fn folding_across_new_year_splits_by_year_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2024, 1, 1),
            &[
                line(1, "2023-12-31 23:59:58"),
                line(2, "2024-01-01 00:00:03"),
            ],
        );
        fold_aged(dir.path(), "reported", day(2024, 1, 3)).unwrap();

        let archive_root = dir.path().join(HISTORY_DIR).join(ARCHIVE_DIR);
        assert!(archive_root
            .join("2023")
            .join("reported.2023-12-31.zip")
            .exists());
        assert!(archive_root
            .join("2024")
            .join("reported.2024-01-01.zip")
            .exists());

        // A window reaching back across the boundary reads both years.
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let documents = load(dir.path(), "reported", 10, now).unwrap();
        assert_eq!(documents.len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 8),
            &["not json at all".to_string(), line(5, "2024-03-08 12:00:00")],
        );
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();

        assert!(!dir
            .path()
            .join(HISTORY_DIR)
            .join("reported.2024-03-08.txt")
            .exists());
        assert_eq!(
            archived_lines(dir.path(), "reported", day(2024, 3, 8)),
            vec![line(5, "2024-03-08 12:00:00")]
        );
    }

    #[test]
    fn load_merges_archives_and_hot_logs() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 1),
            &[line(1, "2024-03-01 10:00:00")],
        );
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 10),
            &[line(2, "2024-03-10 08:00:00")],
        );

        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let documents = load(dir.path(), "reported", 30, now).unwrap();
        assert_eq!(documents.len(), 2);
    }

    #[test]
    fn load_skips_archives_older_than_the_window() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "reported",
            day(2023, 12, 20),
            &[line(1, "2023-12-20 10:00:00")],
        );
        write_log(
            dir.path(),
            "reported",
            day(2024, 3, 1),
            &[line(2, "2024-03-01 10:00:00")],
        );
        fold_aged(dir.path(), "reported", day(2024, 3, 10)).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let documents = load(dir.path(), "reported", 30, now).unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].timestamp_utc, "2024-03-01 10:00:00");
    }

    #[test]
    fn load_ignores_other_axes() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "desired",
            day(2024, 3, 10),
            &[line(1, "2024-03-10 08:00:00")],
        );
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert!(load(dir.path(), "reported", 30, now).unwrap().is_empty());
    }
}
