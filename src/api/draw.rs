//! Human-readable model snapshot for the `DrawAll` command

use crate::model::registry::Model;
use crate::model::ConnectorStatus;
use chrono::Local;

/// Render the group tree with chargers, connectors and live sessions.
pub fn draw_all(model: &Model) -> String {
    let mut out = String::new();
    let now = Local::now();

    let mut roots: Vec<&str> = model
        .groups
        .values()
        .filter(|g| g.parent_id.is_none())
        .map(|g| g.group_id.as_str())
        .collect();
    roots.sort();

    for root in roots {
        draw_group(model, root, 0, &mut out);
    }
    if out.is_empty() {
        out.push_str("(empty model)\n");
    }
    out.push_str(&format!("-- drawn {}\n", now.format("%Y-%m-%d %H:%M:%S")));
    out
}

fn draw_group(model: &Model, group_id: &str, depth: usize, out: &mut String) {
    let Some(group) = model.groups.get(group_id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    let schedule = group
        .max_allocation
        .as_ref()
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default();
    let suspended = if group.allocator_suspended {
        " (suspended)"
    } else {
        ""
    };
    out.push_str(&format!(
        "{}Group {}{}{}{}\n",
        indent,
        group.group_id,
        group
            .description
            .as_ref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default(),
        schedule,
        suspended,
    ));

    let mut chargers: Vec<_> = model
        .chargers
        .values()
        .filter(|c| c.group_id == group_id)
        .collect();
    chargers.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
    for charger in chargers {
        let link = if charger.connected { "up" } else { "down" };
        out.push_str(&format!(
            "{}  {} ({}) {} conn_max={}A\n",
            indent, charger.alias, charger.charger_id, link, charger.conn_max
        ));
        for conn in charger.connectors.values() {
            let mut line = format!(
                "{}    {}: {} offer={}A",
                indent, conn.connector_id, conn.status, conn.offer
            );
            if let Some(session) = &conn.session {
                line.push_str(&format!(
                    " tx={} tag={} energy={:.3}kWh usage={}",
                    session.transaction_id,
                    session.id_tag,
                    session.energy_delivered_wh() as f64 / 1000.0,
                    session
                        .usage_a
                        .map(|u| format!("{:.1}A", u))
                        .unwrap_or_else(|| "-".into()),
                ));
            }
            if conn.status == ConnectorStatus::SuspendedEVSE {
                if let Some(until) = conn.suspend_until {
                    line.push_str(&format!(
                        " until={}",
                        until.with_timezone(&Local).format("%H:%M:%S")
                    ));
                }
            }
            line.push('\n');
            out.push_str(&line);
        }
    }

    let mut children: Vec<&str> = model
        .groups
        .values()
        .filter(|g| g.parent_id.as_deref() == Some(group_id))
        .map(|g| g.group_id.as_str())
        .collect();
    children.sort();
    for child in children {
        draw_group(model, child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Charger, Group, Model};

    #[test]
    fn renders_tree_with_chargers() {
        let mut model = Model::default();
        model
            .groups
            .insert("SITE".into(), Group::new("SITE", None, Some("HQ".into()), None, None));
        model.groups.insert(
            "SITE-A".into(),
            Group::new("SITE-A", Some("SITE".into()), None, None, None),
        );
        model.chargers.insert(
            "CP-1".into(),
            Charger::new("CP-1", "bay-1", "SITE-A", 2, None, None, 32, None),
        );

        let text = draw_all(&model);
        assert!(text.contains("Group SITE (HQ)"));
        assert!(text.contains("Group SITE-A"));
        assert!(text.contains("bay-1 (CP-1) down conn_max=32A"));
        assert!(text.contains("1: Unknown offer=0A"));
        assert!(text.contains("2: Unknown offer=0A"));
    }
}
