use crate::model::{OrganizationId, Registry, ShiftAssignment};
use crate::scheduler::ShiftSpec;
use anyhow::{bail, Context};
use chrono::NaiveTime;
use csv::{ReaderBuilder, WriterBuilder};
use std::fs;
use std::path::Path;

/// Import de modèles de poste depuis CSV.
///
/// Header : `name,start_time,end_time[,break_minutes][,days][,minimum_staff][,maximum_staff][,overtime_allowed]`.
/// Heures au format `HH:MM` ; `days` liste les jours 0-6 (0 = dimanche)
/// séparés par `;`, vide = tous les jours.
pub fn import_shifts_csv<P: AsRef<Path>>(
    path: P,
    organization: &OrganizationId,
) -> anyhow::Result<Vec<ShiftSpec>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut out = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        let row = line + 2;
        let name = rec.get(0).context("missing name")?.trim();
        if name.is_empty() {
            bail!("row {row}: empty shift name");
        }
        let start = parse_time(rec.get(1).context("missing start_time")?)
            .with_context(|| format!("row {row}: start_time"))?;
        let end = parse_time(rec.get(2).context("missing end_time")?)
            .with_context(|| format!("row {row}: end_time"))?;

        let mut spec = ShiftSpec::new(organization.clone(), name, start, end);
        if let Some(raw) = optional(rec.get(3)) {
            spec.break_minutes = raw
                .parse()
                .with_context(|| format!("row {row}: invalid break_minutes {raw}"))?;
        }
        if let Some(raw) = optional(rec.get(4)) {
            spec.applicable_days =
                parse_days(raw).with_context(|| format!("row {row}: invalid days {raw}"))?;
        }
        if let Some(raw) = optional(rec.get(5)) {
            spec.minimum_staff = raw
                .parse()
                .with_context(|| format!("row {row}: invalid minimum_staff {raw}"))?;
        }
        if let Some(raw) = optional(rec.get(6)) {
            spec.maximum_staff = Some(
                raw.parse()
                    .with_context(|| format!("row {row}: invalid maximum_staff {raw}"))?,
            );
        }
        if let Some(raw) = optional(rec.get(7)) {
            spec.overtime_allowed =
                parse_bool(raw).with_context(|| format!("row {row}: invalid overtime_allowed"))?;
        }
        out.push(spec);
    }
    Ok(out)
}

fn optional(field: Option<&str>) -> Option<&str> {
    field.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_time(raw: &str) -> anyhow::Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .with_context(|| format!("expected HH:MM, got {raw}"))
}

fn parse_days(raw: &str) -> anyhow::Result<Vec<u8>> {
    let mut days = raw
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            let day: u8 = d.parse().with_context(|| format!("not a weekday: {d}"))?;
            if day > 6 {
                bail!("weekday {day} out of range 0-6");
            }
            Ok(day)
        })
        .collect::<anyhow::Result<Vec<u8>>>()?;
    days.sort_unstable();
    days.dedup();
    Ok(days)
}

fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "oui" => Ok(true),
        "false" | "0" | "no" | "n" | "non" => Ok(false),
        _ => bail!("expected boolean"),
    }
}

/// Export JSON du registre complet (jolie mise en forme).
pub fn export_registry_json<P: AsRef<Path>>(path: P, registry: &Registry) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(registry)?;
    fs::write(path, s)?;
    Ok(())
}

/// Export CSV des affectations, triées par date puis salarié.
///
/// Header : `id,date,shift,shift_name,employee,status,roster,overtime_minutes`.
pub fn export_assignments_csv<P: AsRef<Path>>(
    path: P,
    registry: &Registry,
    assignments: &[ShiftAssignment],
) -> anyhow::Result<()> {
    let mut rows: Vec<&ShiftAssignment> = assignments.iter().collect();
    rows.sort_by(|a, b| (a.date, &a.employee).cmp(&(b.date, &b.employee)));

    let mut w = WriterBuilder::new().has_headers(true).from_path(path)?;
    w.write_record([
        "id",
        "date",
        "shift",
        "shift_name",
        "employee",
        "status",
        "roster",
        "overtime_minutes",
    ])?;
    for a in rows {
        let shift_name = registry
            .find_shift(&a.shift)
            .map(|s| s.name.as_str())
            .unwrap_or("");
        let date = a.date.to_string();
        let overtime = a.overtime_minutes.to_string();
        w.write_record([
            a.id.as_str(),
            date.as_str(),
            a.shift.as_str(),
            shift_name,
            a.employee.as_str(),
            a.status.as_str(),
            a.roster.as_ref().map(|r| r.as_str()).unwrap_or(""),
            overtime.as_str(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn imports_shift_rows_with_optional_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name,start_time,end_time,break_minutes,days,minimum_staff,maximum_staff,overtime_allowed"
        )
        .unwrap();
        writeln!(file, "Morning,08:00,16:00,30,1;2;3;4;5,2,3,yes").unwrap();
        writeln!(file, "Night,22:00,06:00,,,,,").unwrap();
        file.flush().unwrap();

        let org = OrganizationId::new("org");
        let specs = import_shifts_csv(file.path(), &org).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].applicable_days, vec![1, 2, 3, 4, 5]);
        assert_eq!(specs[0].maximum_staff, Some(3));
        assert!(specs[0].overtime_allowed);
        assert_eq!(specs[1].break_minutes, 0);
        assert_eq!(specs[1].applicable_days.len(), 7);
    }

    #[test]
    fn rejects_bad_weekday() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "name,start_time,end_time,break_minutes,days").unwrap();
        writeln!(file, "Morning,08:00,16:00,0,7").unwrap();
        file.flush().unwrap();

        let err = import_shifts_csv(file.path(), &OrganizationId::new("org")).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
    }
}
