//! CSV persistence for model entities
//!
//! Groups, chargers, tags and the firmware catalogue are loaded from CSV
//! at boot and rewritten on demand (admin edits, AuthorizationKey
//! issuance). Empty fields map to `None`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::charger::Charger;
use crate::model::firmware::FirmwareRecord;
use crate::model::group::Group;
use crate::model::registry::Model;
use crate::model::schedule::Schedule;
use crate::model::tag::{Tag, TagStatus};
use crate::support::errors::ConfigError;

fn csv_error(path: &Path, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Csv {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, ConfigError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, e))
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct GroupRow {
    group_id: String,
    parent_id: Option<String>,
    description: Option<String>,
    priority: Option<i32>,
    max_allocation: Option<String>,
}

pub fn load_groups(path: &Path) -> Result<HashMap<String, Group>, ConfigError> {
    let mut groups = HashMap::new();
    for row in reader(path)?.deserialize() {
        let row: GroupRow = row.map_err(|e| csv_error(path, e))?;
        let schedule = match row.max_allocation.as_deref().filter(|s| !s.is_empty()) {
            Some(text) => Some(Schedule::parse(text).map_err(|e| csv_error(path, e))?),
            None => None,
        };
        let group = Group::new(
            row.group_id.clone(),
            row.parent_id.filter(|s| !s.is_empty()),
            row.description.filter(|s| !s.is_empty()),
            row.priority,
            schedule,
        );
        groups.insert(row.group_id, group);
    }
    Ok(groups)
}

pub fn write_groups(path: &Path, groups: &HashMap<String, Group>) -> Result<(), ConfigError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut sorted: Vec<&Group> = groups.values().collect();
    sorted.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    for group in sorted {
        writer
            .serialize(GroupRow {
                group_id: group.group_id.clone(),
                parent_id: group.parent_id.clone(),
                description: group.description.clone(),
                priority: group.priority,
                max_allocation: group.max_allocation.as_ref().map(|s| s.to_string()),
            })
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| csv_error(path, e))
}

// ── Chargers ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct ChargerRow {
    charger_id: String,
    alias: String,
    group_id: String,
    no_connectors: Option<u32>,
    priority: Option<i32>,
    description: Option<String>,
    conn_max: Option<u32>,
    auth_sha: Option<String>,
}

pub fn load_chargers(
    path: &Path,
    default_conn_max: u32,
) -> Result<HashMap<String, Charger>, ConfigError> {
    let mut chargers = HashMap::new();
    for row in reader(path)?.deserialize() {
        let row: ChargerRow = row.map_err(|e| csv_error(path, e))?;
        let charger = Charger::new(
            row.charger_id.clone(),
            row.alias,
            row.group_id,
            row.no_connectors.unwrap_or(1),
            row.priority,
            row.description.filter(|s| !s.is_empty()),
            row.conn_max.unwrap_or(default_conn_max),
            row.auth_sha.filter(|s| !s.is_empty()),
        );
        chargers.insert(row.charger_id, charger);
    }
    Ok(chargers)
}

pub fn write_chargers(path: &Path, chargers: &HashMap<String, Charger>) -> Result<(), ConfigError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut sorted: Vec<&Charger> = chargers.values().collect();
    sorted.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
    for charger in sorted {
        writer
            .serialize(ChargerRow {
                charger_id: charger.charger_id.clone(),
                alias: charger.alias.clone(),
                group_id: charger.group_id.clone(),
                no_connectors: Some(charger.connectors.len() as u32),
                priority: charger.priority,
                description: charger.description.clone(),
                conn_max: Some(charger.conn_max),
                auth_sha: charger.auth_sha.clone(),
            })
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| csv_error(path, e))
}

// ── Tags ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct TagRow {
    id_tag: String,
    user_name: Option<String>,
    parent_id_tag: Option<String>,
    description: Option<String>,
    status: Option<String>,
    priority: Option<i32>,
}

pub fn load_tags(path: &Path) -> Result<HashMap<String, Tag>, ConfigError> {
    let mut tags = HashMap::new();
    for row in reader(path)?.deserialize() {
        let row: TagRow = row.map_err(|e| csv_error(path, e))?;
        let tag = Tag::new(
            row.id_tag,
            row.user_name.filter(|s| !s.is_empty()),
            row.parent_id_tag.filter(|s| !s.is_empty()),
            row.description.filter(|s| !s.is_empty()),
            row.status.as_deref().map(TagStatus::from).unwrap_or(TagStatus::Activated),
            row.priority,
        );
        tags.insert(tag.id_tag.clone(), tag);
    }
    Ok(tags)
}

pub fn write_tags(path: &Path, tags: &HashMap<String, Tag>) -> Result<(), ConfigError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut sorted: Vec<&Tag> = tags.values().collect();
    sorted.sort_by(|a, b| a.id_tag.cmp(&b.id_tag));
    for tag in sorted {
        writer
            .serialize(TagRow {
                id_tag: tag.id_tag.clone(),
                user_name: tag.user_name.clone(),
                parent_id_tag: tag.parent_id_tag.clone(),
                description: tag.description.clone(),
                status: Some(tag.status.to_string()),
                priority: tag.priority,
            })
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| csv_error(path, e))
}

// ── Firmware ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct FirmwareRow {
    firmware_id: String,
    charge_point_model: String,
    firmware_version: String,
    location: String,
}

pub fn load_firmware(path: &Path) -> Result<Vec<FirmwareRecord>, ConfigError> {
    let mut records = Vec::new();
    for row in reader(path)?.deserialize() {
        let row: FirmwareRow = row.map_err(|e| csv_error(path, e))?;
        records.push(FirmwareRecord {
            firmware_id: row.firmware_id,
            charge_point_model: row.charge_point_model,
            firmware_version: row.firmware_version,
            location: row.location,
        });
    }
    Ok(records)
}

pub fn write_firmware(path: &Path, firmware: &[FirmwareRecord]) -> Result<(), ConfigError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut sorted: Vec<&FirmwareRecord> = firmware.iter().collect();
    sorted.sort_by(|a, b| a.firmware_id.cmp(&b.firmware_id));
    for record in sorted {
        writer
            .serialize(FirmwareRow {
                firmware_id: record.firmware_id.clone(),
                charge_point_model: record.charge_point_model.clone(),
                firmware_version: record.firmware_version.clone(),
                location: record.location.clone(),
            })
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| csv_error(path, e))
}

/// Load the whole model at boot.
pub fn load_model(
    groups_csv: &Path,
    chargers_csv: &Path,
    tags_csv: &Path,
    firmware_csv: Option<&Path>,
    default_conn_max: u32,
) -> Result<Model, ConfigError> {
    Ok(Model {
        groups: load_groups(groups_csv)?,
        chargers: load_chargers(chargers_csv, default_conn_max)?,
        tags: load_tags(tags_csv)?,
        firmware: match firmware_csv {
            Some(path) if path.exists() => load_firmware(path)?,
            _ => Vec::new(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn groups_roundtrip() {
        let dir = tempdir("ampshare_store_groups");
        let path = dir.join("groups.csv");
        std::fs::write(
            &path,
            "group_id,parent_id,description,priority,max_allocation\n\
             RR2,,Road Runner 2 Site,,00:00-23:59>0=24:3=40:5=48\n\
             RR2-LOW,RR2,Low priority bays,1,\n",
        )
        .unwrap();

        let groups = load_groups(&path).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups["RR2"].is_allocation_group());
        assert_eq!(groups["RR2-LOW"].parent_id.as_deref(), Some("RR2"));
        assert_eq!(groups["RR2-LOW"].priority, Some(1));

        let out = dir.join("groups_out.csv");
        write_groups(&out, &groups).unwrap();
        let reloaded = load_groups(&out).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded["RR2"].is_allocation_group());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn groups_with_bad_schedule_fail() {
        let dir = tempdir("ampshare_store_badsched");
        let path = dir.join("groups.csv");
        std::fs::write(
            &path,
            "group_id,parent_id,description,priority,max_allocation\n\
             G1,,desc,,06:00-23:59>0=24\n",
        )
        .unwrap();
        assert!(load_groups(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn chargers_roundtrip_with_defaults() {
        let dir = tempdir("ampshare_store_chargers");
        let path = dir.join("chargers.csv");
        std::fs::write(
            &path,
            "charger_id,alias,group_id,no_connectors,priority,description,conn_max,auth_sha\n\
             TACW224317G584,RR2-01,RR2,1,3,,32,\n\
             TACW223437G682,RR2-04,RR2,2,,,, \n",
        )
        .unwrap();

        let chargers = load_chargers(&path, 16).unwrap();
        assert_eq!(chargers.len(), 2);
        assert_eq!(chargers["TACW224317G584"].conn_max, 32);
        assert_eq!(chargers["TACW224317G584"].priority, Some(3));
        assert_eq!(chargers["TACW223437G682"].conn_max, 16);
        assert_eq!(chargers["TACW223437G682"].connectors.len(), 2);
        assert!(chargers["TACW223437G682"].auth_sha.is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tags_roundtrip() {
        let dir = tempdir("ampshare_store_tags");
        let path = dir.join("tags.csv");
        std::fs::write(
            &path,
            "id_tag,user_name,parent_id_tag,description,status,priority\n\
             e08cee18,wile,ACME,,Activated,5\n\
             11223344,,,blocked card,Blocked,\n",
        )
        .unwrap();

        let tags = load_tags(&path).unwrap();
        assert_eq!(tags.len(), 2);
        // Uppercased on load.
        assert_eq!(tags["E08CEE18"].priority, Some(5));
        assert_eq!(tags["11223344"].status, TagStatus::Blocked);

        let out = dir.join("tags_out.csv");
        write_tags(&out, &tags).unwrap();
        let reloaded = load_tags(&out).unwrap();
        assert_eq!(reloaded["E08CEE18"].parent_id_tag.as_deref(), Some("ACME"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn firmware_roundtrip() {
        let dir = tempdir("ampshare_store_firmware");
        let path = dir.join("firmware.csv");
        let records = vec![FirmwareRecord {
            firmware_id: "fw-1".into(),
            charge_point_model: "TACW22".into(),
            firmware_version: "1.6.0".into(),
            location: "https://fw.example.net/tacw22-1.6.0.bin".into(),
        }];
        write_firmware(&path, &records).unwrap();
        let reloaded = load_firmware(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].charge_point_model, "TACW22");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_groups(Path::new("/nonexistent/groups.csv")).is_err());
    }
}
