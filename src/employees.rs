//! Staff records, daily attendance, payroll deductions and the monthly
//! payroll summary.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::info;
use uuid::Uuid;

use crate::data_helpers::{is_valid_phone, normalize_phone};
use crate::db::DbState;
use crate::pricing::{self, round, to_decimal, to_f64};
use crate::settings;

static NATIONAL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[23][0-9]{13}$").expect("valid national id regex"));

const TIME_FORMAT: &str = "%H:%M";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const MAX_GRACE_MINUTES: u32 = 120;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkSchedule {
    /// `HH:MM`, local time.
    pub work_start: String,
    pub work_end: String,
    /// 0 = Sunday .. 6 = Saturday.
    pub work_days: Vec<u8>,
    pub grace_minutes: u32,
}

impl Default for WorkSchedule {
    fn default() -> Self {
        Self {
            work_start: "09:00".into(),
            work_end: "17:00".into(),
            work_days: vec![0, 1, 2, 3, 4, 6],
            grace_minutes: 0,
        }
    }
}

impl WorkSchedule {
    fn start(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(self.work_start.trim(), TIME_FORMAT)
            .map_err(|_| format!("Invalid start time: {}", self.work_start))
    }

    fn end(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(self.work_end.trim(), TIME_FORMAT)
            .map_err(|_| format!("Invalid end time: {}", self.work_end))
    }

    /// Scheduled working minutes per day.
    pub fn minutes_per_day(&self) -> Result<i64, String> {
        Ok((self.end()? - self.start()?).num_minutes())
    }

    pub fn works_on(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday() as u8;
        self.work_days.contains(&weekday)
    }

    fn validate(&mut self) -> Result<(), String> {
        let start = self.start()?;
        let end = self.end()?;
        if end <= start {
            return Err("موعد الانصراف يجب أن يكون بعد موعد الحضور".into());
        }
        self.work_start = start.format(TIME_FORMAT).to_string();
        self.work_end = end.format(TIME_FORMAT).to_string();
        if self.work_days.iter().any(|d| *d > 6) {
            return Err("Work days must be between 0 (Sunday) and 6 (Saturday)".into());
        }
        let days: BTreeSet<u8> = self.work_days.iter().copied().collect();
        if days.is_empty() {
            return Err("At least one work day is required".into());
        }
        self.work_days = days.into_iter().collect();
        if self.grace_minutes > MAX_GRACE_MINUTES {
            return Err(format!("Grace period cannot exceed {MAX_GRACE_MINUTES} minutes"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub phone: String,
    pub national_id: String,
    #[serde(default)]
    pub monthly_salary: f64,
    #[serde(default)]
    pub schedule: WorkSchedule,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

fn default_active() -> bool {
    true
}

impl Employee {
    pub fn validate(&mut self) -> Result<(), String> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err("اسم الموظف مطلوب".into());
        }
        if !is_valid_phone(&self.phone) {
            return Err("رقم الهاتف غير صحيح".into());
        }
        self.phone = normalize_phone(&self.phone);
        let national_id: String = crate::search::normalize_arabic(&self.national_id)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if !NATIONAL_ID_RE.is_match(&national_id) {
            return Err("الرقم القومي يجب أن يكون 14 رقماً".into());
        }
        self.national_id = national_id;
        if !self.monthly_salary.is_finite() || self.monthly_salary < 0.0 {
            return Err("المرتب لا يمكن أن يكون سالباً".into());
        }
        pricing::check_amount(self.monthly_salary, "monthly salary")?;
        self.schedule.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionKind {
    Advance,
    Penalty,
    Other,
}

impl DeductionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionKind::Advance => "advance",
            DeductionKind::Penalty => "penalty",
            DeductionKind::Other => "other",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "advance" => DeductionKind::Advance,
            "penalty" => DeductionKind::Penalty,
            _ => DeductionKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    #[serde(default)]
    pub id: String,
    pub employee_id: String,
    pub kind: DeductionKind,
    pub amount: f64,
    /// `YYYY-MM-DD`.
    pub date: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub employee_id: String,
    pub date: String,
    pub check_in: String,
    pub check_out: Option<String>,
    pub late_minutes: i64,
    pub overtime_minutes: i64,
    pub worked_minutes: i64,
}

// ---------------------------------------------------------------------------
// Employees
// ---------------------------------------------------------------------------

const EMPLOYEE_COLUMNS: &str = "id, name, phone, national_id, monthly_salary, work_start, \
                                work_end, work_days, grace_minutes, active, created_at, updated_at";

fn row_to_employee(row: &rusqlite::Row<'_>) -> rusqlite::Result<Employee> {
    let work_days: String = row.get(7)?;
    Ok(Employee {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        national_id: row.get(3)?,
        monthly_salary: row.get(4)?,
        schedule: WorkSchedule {
            work_start: row.get(5)?,
            work_end: row.get(6)?,
            work_days: serde_json::from_str(&work_days).unwrap_or_default(),
            grace_minutes: row.get(8)?,
        },
        active: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn load_employee(conn: &Connection, id: &str) -> Result<Employee, String> {
    conn.query_row(
        &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = ?1"),
        params![id],
        row_to_employee,
    )
    .optional()
    .map_err(|e| format!("get employee: {e}"))?
    .ok_or(format!("Employee not found: {id}"))
}

fn national_id_taken(conn: &Connection, national_id: &str, except_id: &str) -> Result<bool, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM employees WHERE national_id = ?1 AND id != ?2",
        params![national_id, except_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| format!("check national id: {e}"))
}

fn write_employee(conn: &Connection, e: &Employee) -> Result<(), String> {
    let work_days = serde_json::to_string(&e.schedule.work_days).map_err(|e| e.to_string())?;
    conn.execute(
        &format!(
            "INSERT INTO employees ({EMPLOYEE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, phone = excluded.phone,
                national_id = excluded.national_id, monthly_salary = excluded.monthly_salary,
                work_start = excluded.work_start, work_end = excluded.work_end,
                work_days = excluded.work_days, grace_minutes = excluded.grace_minutes,
                active = excluded.active, updated_at = excluded.updated_at"
        ),
        params![
            e.id,
            e.name,
            e.phone,
            e.national_id,
            e.monthly_salary,
            e.schedule.work_start,
            e.schedule.work_end,
            work_days,
            e.schedule.grace_minutes,
            e.active as i64,
            e.created_at,
            e.updated_at,
        ],
    )
    .map_err(|e| format!("save employee: {e}"))?;
    Ok(())
}

pub fn list_employees(db: &DbState, include_inactive: bool) -> Result<Vec<Employee>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EMPLOYEE_COLUMNS} FROM employees
             WHERE active = 1 OR ?1
             ORDER BY name COLLATE NOCASE ASC"
        ))
        .map_err(|e| format!("list employees: {e}"))?;
    let rows = stmt
        .query_map(params![include_inactive], row_to_employee)
        .map_err(|e| format!("list employees: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_employee(db: &DbState, id: &str) -> Result<Employee, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_employee(&conn, id)
}

pub fn create_employee(db: &DbState, mut employee: Employee) -> Result<Employee, String> {
    employee.validate()?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    if national_id_taken(&conn, &employee.national_id, "")? {
        return Err("Duplicate national ID: employee already registered".into());
    }
    let now = Utc::now().to_rfc3339();
    employee.id = Uuid::new_v4().to_string();
    employee.created_at = now.clone();
    employee.updated_at = now;
    write_employee(&conn, &employee)?;
    info!(employee_id = %employee.id, "employee created");
    Ok(employee)
}

const PATCHABLE: &[&str] = &["name", "phone", "national_id", "monthly_salary", "schedule", "active"];

pub fn update_employee(db: &DbState, id: &str, patch: &Value) -> Result<Employee, String> {
    let obj = patch.as_object().ok_or("Patch must be a JSON object")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_employee(&conn, id)?;

    let mut merged = serde_json::to_value(&current).map_err(|e| e.to_string())?;
    for (k, v) in obj.iter().filter(|(k, _)| PATCHABLE.contains(&k.as_str())) {
        match (k.as_str(), v) {
            ("schedule", Value::Object(fields)) => {
                for (field, value) in fields {
                    merged["schedule"][field] = value.clone();
                }
            }
            _ => merged[k] = v.clone(),
        }
    }
    let mut updated: Employee =
        serde_json::from_value(merged).map_err(|e| format!("Invalid employee patch: {e}"))?;
    updated.validate()?;
    if national_id_taken(&conn, &updated.national_id, id)? {
        return Err("Duplicate national ID: employee already registered".into());
    }
    updated.updated_at = Utc::now().to_rfc3339();
    write_employee(&conn, &updated)?;
    Ok(updated)
}

/// Removes the employee with their attendance and deductions.
pub fn delete_employee(db: &DbState, id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_employee(&conn, id)?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<(), String> {
        for table in ["attendance", "deductions", "employees"] {
            let column = if table == "employees" { "id" } else { "employee_id" };
            conn.execute(&format!("DELETE FROM {table} WHERE {column} = ?1"), params![id])
                .map_err(|e| format!("delete employee: {e}"))?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT").map_err(|e| format!("commit: {e}"))?;
            info!(employee_id = %id, "employee deleted");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Attendance
// ---------------------------------------------------------------------------

const ATTENDANCE_COLUMNS: &str = "id, employee_id, work_date, check_in, check_out, late_minutes, \
                                  overtime_minutes, worked_minutes";

fn row_to_attendance(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        date: row.get(2)?,
        check_in: row.get(3)?,
        check_out: row.get(4)?,
        late_minutes: row.get(5)?,
        overtime_minutes: row.get(6)?,
        worked_minutes: row.get(7)?,
    })
}

fn attendance_on(conn: &Connection, employee_id: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, String> {
    conn.query_row(
        &format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE employee_id = ?1 AND work_date = ?2"),
        params![employee_id, date.to_string()],
        row_to_attendance,
    )
    .optional()
    .map_err(|e| format!("get attendance: {e}"))
}

/// Minutes between `a` and `b`, zero when `b` is not later.
fn minutes_after(a: NaiveTime, b: NaiveTime) -> i64 {
    (b - a).num_minutes().max(0)
}

/// Record arrival. One record per employee per day; lateness counts from
/// the scheduled start plus the grace period, on scheduled days only.
pub fn check_in(db: &DbState, employee_id: &str, at: NaiveDateTime) -> Result<AttendanceRecord, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let employee = load_employee(&conn, employee_id)?;
    if !employee.active {
        return Err("الموظف غير نشط".into());
    }
    let date = at.date();
    if attendance_on(&conn, employee_id, date)?.is_some() {
        return Err("تم تسجيل الحضور لهذا اليوم بالفعل".into());
    }

    let late_minutes = if employee.schedule.works_on(date) {
        let allowed = employee.schedule.start()?
            + chrono::Duration::minutes(i64::from(employee.schedule.grace_minutes));
        minutes_after(allowed, at.time())
    } else {
        0
    };
    let record = AttendanceRecord {
        id: Uuid::new_v4().to_string(),
        employee_id: employee_id.to_string(),
        date: date.to_string(),
        check_in: at.format(STAMP_FORMAT).to_string(),
        check_out: None,
        late_minutes,
        overtime_minutes: 0,
        worked_minutes: 0,
    };
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO attendance (id, employee_id, work_date, check_in, late_minutes,
                                 created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![record.id, record.employee_id, record.date, record.check_in, late_minutes, now],
    )
    .map_err(|e| format!("check in: {e}"))?;
    info!(employee_id, late_minutes, "checked in");
    Ok(record)
}

/// Close the open record of the day `at` falls on.
pub fn check_out(db: &DbState, employee_id: &str, at: NaiveDateTime) -> Result<AttendanceRecord, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let employee = load_employee(&conn, employee_id)?;
    let mut record = attendance_on(&conn, employee_id, at.date())?
        .ok_or("لم يتم تسجيل الحضور لهذا اليوم")?;
    if record.check_out.is_some() {
        return Err("تم تسجيل الانصراف لهذا اليوم بالفعل".into());
    }
    let checked_in = NaiveDateTime::parse_from_str(&record.check_in, STAMP_FORMAT)
        .map_err(|e| format!("corrupt check-in time: {e}"))?;
    if at < checked_in {
        return Err("وقت الانصراف قبل وقت الحضور".into());
    }

    record.worked_minutes = (at - checked_in).num_minutes();
    record.overtime_minutes = minutes_after(employee.schedule.end()?, at.time());
    record.check_out = Some(at.format(STAMP_FORMAT).to_string());
    conn.execute(
        "UPDATE attendance SET check_out = ?1, overtime_minutes = ?2, worked_minutes = ?3,
                updated_at = ?4
         WHERE id = ?5",
        params![
            record.check_out,
            record.overtime_minutes,
            record.worked_minutes,
            Utc::now().to_rfc3339(),
            record.id
        ],
    )
    .map_err(|e| format!("check out: {e}"))?;
    info!(
        employee_id,
        worked_minutes = record.worked_minutes,
        overtime_minutes = record.overtime_minutes,
        "checked out"
    );
    Ok(record)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AttendanceFilter {
    pub employee_id: Option<String>,
    /// Inclusive `YYYY-MM-DD` bounds.
    pub from: Option<String>,
    pub to: Option<String>,
}

fn query_attendance(conn: &Connection, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance
             WHERE (?1 IS NULL OR employee_id = ?1)
               AND (?2 IS NULL OR work_date >= ?2)
               AND (?3 IS NULL OR work_date <= ?3)
             ORDER BY work_date DESC, check_in DESC"
        ))
        .map_err(|e| format!("list attendance: {e}"))?;
    let rows = stmt
        .query_map(
            params![filter.employee_id, filter.from, filter.to],
            row_to_attendance,
        )
        .map_err(|e| format!("list attendance: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_attendance(db: &DbState, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_attendance(&conn, filter)
}

// ---------------------------------------------------------------------------
// Deductions
// ---------------------------------------------------------------------------

fn validate_deduction(d: &Deduction) -> Result<(), String> {
    if !d.amount.is_finite() || d.amount <= 0.0 {
        return Err("قيمة الخصم يجب أن تكون أكبر من صفر".into());
    }
    pricing::check_amount(d.amount, "deduction")?;
    NaiveDate::parse_from_str(&d.date, "%Y-%m-%d")
        .map_err(|_| format!("Invalid deduction date: {}", d.date))?;
    Ok(())
}

fn row_to_deduction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deduction> {
    let kind: String = row.get(2)?;
    Ok(Deduction {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        kind: DeductionKind::parse(&kind),
        amount: row.get(3)?,
        date: row.get(4)?,
        note: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const DEDUCTION_COLUMNS: &str = "id, employee_id, kind, amount, deduction_date, note, created_at";

fn load_deduction(conn: &Connection, id: &str) -> Result<Deduction, String> {
    conn.query_row(
        &format!("SELECT {DEDUCTION_COLUMNS} FROM deductions WHERE id = ?1"),
        params![id],
        row_to_deduction,
    )
    .optional()
    .map_err(|e| format!("get deduction: {e}"))?
    .ok_or(format!("Deduction not found: {id}"))
}

pub fn add_deduction(db: &DbState, mut deduction: Deduction) -> Result<Deduction, String> {
    validate_deduction(&deduction)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_employee(&conn, &deduction.employee_id)?;
    deduction.id = Uuid::new_v4().to_string();
    deduction.created_at = Utc::now().to_rfc3339();
    deduction.note = deduction.note.filter(|n| !n.trim().is_empty());
    conn.execute(
        &format!("INSERT INTO deductions ({DEDUCTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            deduction.id,
            deduction.employee_id,
            deduction.kind.as_str(),
            deduction.amount,
            deduction.date,
            deduction.note,
            deduction.created_at,
        ],
    )
    .map_err(|e| format!("insert deduction: {e}"))?;
    info!(employee_id = %deduction.employee_id, kind = deduction.kind.as_str(), amount = deduction.amount, "deduction added");
    Ok(deduction)
}

pub fn update_deduction(db: &DbState, id: &str, patch: &Value) -> Result<Deduction, String> {
    let obj = patch.as_object().ok_or("Patch must be a JSON object")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_deduction(&conn, id)?;
    let mut merged = serde_json::to_value(&current).map_err(|e| e.to_string())?;
    for key in ["kind", "amount", "date", "note"] {
        if let Some(v) = obj.get(key) {
            merged[key] = v.clone();
        }
    }
    let updated: Deduction =
        serde_json::from_value(merged).map_err(|e| format!("Invalid deduction patch: {e}"))?;
    validate_deduction(&updated)?;
    conn.execute(
        "UPDATE deductions SET kind = ?1, amount = ?2, deduction_date = ?3, note = ?4 WHERE id = ?5",
        params![updated.kind.as_str(), updated.amount, updated.date, updated.note, id],
    )
    .map_err(|e| format!("update deduction: {e}"))?;
    Ok(updated)
}

pub fn delete_deduction(db: &DbState, id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let removed = conn
        .execute("DELETE FROM deductions WHERE id = ?1", params![id])
        .map_err(|e| format!("delete deduction: {e}"))?;
    if removed == 0 {
        return Err(format!("Deduction not found: {id}"));
    }
    Ok(())
}

fn query_deductions(
    conn: &Connection,
    employee_id: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<Deduction>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DEDUCTION_COLUMNS} FROM deductions
             WHERE (?1 IS NULL OR employee_id = ?1)
               AND (?2 IS NULL OR deduction_date >= ?2)
               AND (?3 IS NULL OR deduction_date <= ?3)
             ORDER BY deduction_date DESC, created_at DESC"
        ))
        .map_err(|e| format!("list deductions: {e}"))?;
    let rows = stmt
        .query_map(params![employee_id, from, to], row_to_deduction)
        .map_err(|e| format!("list deductions: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_deductions(
    db: &DbState,
    employee_id: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<Deduction>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_deductions(&conn, employee_id, from, to)
}

// ---------------------------------------------------------------------------
// Payroll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayrollSummary {
    pub employee_id: String,
    pub employee_name: String,
    pub year: i32,
    pub month: u32,
    pub monthly_salary: f64,
    pub daily_rate: f64,
    pub minute_rate: f64,
    pub scheduled_days: u32,
    pub present_days: u32,
    pub absent_days: u32,
    pub late_minutes: i64,
    pub overtime_minutes: i64,
    pub absence_deduction: f64,
    pub lateness_deduction: f64,
    pub overtime_pay: f64,
    pub advances: f64,
    pub penalties: f64,
    pub other_deductions: f64,
    pub total_deductions: f64,
    pub net_salary: f64,
}

fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), String> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(format!("Invalid month: {year}-{month}"))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or(format!("Invalid month: {year}-{month}"))?;
    Ok((first, next.pred_opt().unwrap_or(first)))
}

/// Payroll for one month. Absences are only counted up to `today`, so the
/// running month is not charged for days that have not happened yet.
pub(crate) fn payroll_as_of(
    conn: &Connection,
    employee_id: &str,
    year: i32,
    month: u32,
    today: NaiveDate,
) -> Result<PayrollSummary, String> {
    let employee = load_employee(conn, employee_id)?;
    let payroll_settings = settings::load(conn).payroll;
    let (first, last) = month_bounds(year, month)?;

    let attendance = query_attendance(
        conn,
        &AttendanceFilter {
            employee_id: Some(employee_id.to_string()),
            from: Some(first.to_string()),
            to: Some(last.to_string()),
        },
    )?;
    let present: BTreeSet<&str> = attendance.iter().map(|a| a.date.as_str()).collect();

    let cutoff = last.min(today);
    let mut scheduled_days = 0u32;
    let mut absent_days = 0u32;
    for date in first.iter_days().take_while(|d| *d <= cutoff) {
        if employee.schedule.works_on(date) {
            scheduled_days += 1;
            if !present.contains(date.to_string().as_str()) {
                absent_days += 1;
            }
        }
    }
    let late_minutes: i64 = attendance.iter().map(|a| a.late_minutes).sum();
    let overtime_minutes: i64 = attendance.iter().map(|a| a.overtime_minutes).sum();

    let deductions = query_deductions(
        conn,
        Some(employee_id),
        Some(&first.to_string()),
        Some(&last.to_string()),
    )?;
    let sum_kind = |kind: DeductionKind| -> Decimal {
        round(
            deductions
                .iter()
                .filter(|d| d.kind == kind)
                .map(|d| to_decimal(d.amount))
                .sum(),
        )
    };
    let advances = sum_kind(DeductionKind::Advance);
    let penalties = sum_kind(DeductionKind::Penalty);
    let other = sum_kind(DeductionKind::Other);

    let salary = to_decimal(employee.monthly_salary);
    let daily_rate = salary / Decimal::from(payroll_settings.month_days.max(1));
    let minutes_per_day = employee.schedule.minutes_per_day()?.max(1);
    let minute_rate = daily_rate / Decimal::from(minutes_per_day);

    let absence_deduction = round(daily_rate * Decimal::from(absent_days));
    let lateness_deduction = round(minute_rate * Decimal::from(late_minutes));
    let overtime_pay = round(
        minute_rate * Decimal::from(overtime_minutes) * to_decimal(payroll_settings.overtime_multiplier),
    );
    let total_deductions = absence_deduction + lateness_deduction + advances + penalties + other;
    let net = (salary + overtime_pay - total_deductions).max(Decimal::ZERO);

    Ok(PayrollSummary {
        employee_id: employee.id,
        employee_name: employee.name,
        year,
        month,
        monthly_salary: to_f64(salary),
        daily_rate: to_f64(daily_rate),
        minute_rate: minute_rate.round_dp(4).to_f64().unwrap_or_default(),
        scheduled_days,
        present_days: present.len() as u32,
        absent_days,
        late_minutes,
        overtime_minutes,
        absence_deduction: to_f64(absence_deduction),
        lateness_deduction: to_f64(lateness_deduction),
        overtime_pay: to_f64(overtime_pay),
        advances: to_f64(advances),
        penalties: to_f64(penalties),
        other_deductions: to_f64(other),
        total_deductions: to_f64(total_deductions),
        net_salary: to_f64(net),
    })
}

pub fn payroll(db: &DbState, employee_id: &str, year: i32, month: u32) -> Result<PayrollSummary, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    payroll_as_of(&conn, employee_id, year, month, Local::now().date_naive())
}

/// Payroll of every active employee for the month.
pub fn payroll_all(db: &DbState, year: i32, month: u32) -> Result<Vec<PayrollSummary>, String> {
    let ids: Vec<String> = list_employees(db, false)?.into_iter().map(|e| e.id).collect();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let today = Local::now().date_naive();
    ids.iter()
        .map(|id| payroll_as_of(&conn, id, year, month, today))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn new_employee(national_id: &str) -> Employee {
        Employee {
            id: String::new(),
            name: " أحمد علي ".into(),
            phone: "+20 100 123 4567".into(),
            national_id: national_id.into(),
            monthly_salary: 3000.0,
            schedule: WorkSchedule {
                grace_minutes: 10,
                ..WorkSchedule::default()
            },
            active: true,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").unwrap()
    }

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_create_normalizes_and_validates() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();
        assert_eq!(e.name, "أحمد علي");
        assert_eq!(e.phone, "01001234567");
        assert!(create_employee(&state, new_employee("29001011234567"))
            .unwrap_err()
            .contains("Duplicate"));
        assert!(create_employee(&state, new_employee("19001011234567")).is_err());
        assert!(create_employee(&state, new_employee("2900101123456")).is_err());

        let mut bad = new_employee("30001011234567");
        bad.schedule.work_end = "08:00".into();
        assert!(create_employee(&state, bad).is_err());
        let mut bad = new_employee("30001011234567");
        bad.monthly_salary = -5.0;
        assert!(create_employee(&state, bad).is_err());
        let mut bad = new_employee("30001011234567");
        bad.monthly_salary = 1e30;
        assert!(create_employee(&state, bad).unwrap_err().contains("supported amount"));
    }

    #[test]
    fn test_update_merges_schedule() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();
        let updated = update_employee(
            &state,
            &e.id,
            &json!({ "schedule": { "work_start": "8:30", "work_days": [6, 0, 0] }, "monthly_salary": 4000 }),
        )
        .unwrap();
        assert_eq!(updated.schedule.work_start, "08:30");
        assert_eq!(updated.schedule.work_end, "17:00");
        assert_eq!(updated.schedule.work_days, vec![0, 6]);
        assert_eq!(updated.monthly_salary, 4000.0);
        assert_eq!(get_employee(&state, &e.id).unwrap(), updated);
    }

    #[test]
    fn test_check_in_and_out() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();

        // Thursday 2024-02-01, 09:25 with 10 minutes grace
        let rec = check_in(&state, &e.id, at("2024-02-01 09:25")).unwrap();
        assert_eq!(rec.late_minutes, 15);
        assert!(check_in(&state, &e.id, at("2024-02-01 10:00")).is_err());
        assert!(check_out(&state, &e.id, at("2024-02-01 09:00")).is_err());

        let rec = check_out(&state, &e.id, at("2024-02-01 18:30")).unwrap();
        assert_eq!(rec.overtime_minutes, 90);
        assert_eq!(rec.worked_minutes, 545);
        assert!(check_out(&state, &e.id, at("2024-02-01 19:00")).is_err());
        assert!(check_out(&state, &e.id, at("2024-02-03 17:00")).is_err());

        // Friday is a day off: no lateness
        let rec = check_in(&state, &e.id, at("2024-02-02 11:00")).unwrap();
        assert_eq!(rec.late_minutes, 0);

        let all = list_attendance(
            &state,
            &AttendanceFilter {
                employee_id: Some(e.id.clone()),
                from: Some("2024-02-01".into()),
                to: Some("2024-02-01".into()),
            },
        )
        .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_deduction_crud() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();
        let d = add_deduction(
            &state,
            Deduction {
                id: String::new(),
                employee_id: e.id.clone(),
                kind: DeductionKind::Advance,
                amount: 200.0,
                date: "2024-02-05".into(),
                note: Some(" ".into()),
                created_at: String::new(),
            },
        )
        .unwrap();
        assert_eq!(d.note, None);
        let d = update_deduction(&state, &d.id, &json!({ "kind": "penalty", "amount": 50 })).unwrap();
        assert_eq!(d.kind, DeductionKind::Penalty);
        assert!(update_deduction(&state, &d.id, &json!({ "amount": 0 })).is_err());
        assert!(update_deduction(&state, &d.id, &json!({ "amount": 1e30 })).is_err());
        assert_eq!(list_deductions(&state, Some(&e.id), None, None).unwrap().len(), 1);
        delete_deduction(&state, &d.id).unwrap();
        assert!(delete_deduction(&state, &d.id).is_err());
    }

    #[test]
    fn test_payroll_month() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();
        check_in(&state, &e.id, at("2024-02-01 09:20")).unwrap();
        check_out(&state, &e.id, at("2024-02-01 18:00")).unwrap();
        check_in(&state, &e.id, at("2024-02-03 09:00")).unwrap();
        check_out(&state, &e.id, at("2024-02-03 17:00")).unwrap();
        add_deduction(
            &state,
            Deduction {
                id: String::new(),
                employee_id: e.id.clone(),
                kind: DeductionKind::Advance,
                amount: 200.0,
                date: "2024-02-10".into(),
                note: None,
                created_at: String::new(),
            },
        )
        .unwrap();

        let conn = state.conn.lock().unwrap();
        let p = payroll_as_of(&conn, &e.id, 2024, 2, date("2024-06-01")).unwrap();
        // 29 days minus 4 Fridays
        assert_eq!(p.scheduled_days, 25);
        assert_eq!(p.present_days, 2);
        assert_eq!(p.absent_days, 23);
        assert_eq!(p.daily_rate, 100.0);
        assert_eq!(p.absence_deduction, 2300.0);
        assert_eq!(p.late_minutes, 10);
        assert_eq!(p.lateness_deduction, 2.08);
        assert_eq!(p.overtime_pay, 18.75);
        assert_eq!(p.advances, 200.0);
        assert_eq!(p.net_salary, 516.67);

        // running month: only days up to today count
        let p = payroll_as_of(&conn, &e.id, 2024, 2, date("2024-02-10")).unwrap();
        assert_eq!(p.scheduled_days, 8);
        assert_eq!(p.absent_days, 6);

        // future month: nothing owed yet, never negative
        let p = payroll_as_of(&conn, &e.id, 2024, 3, date("2024-02-10")).unwrap();
        assert_eq!(p.absent_days, 0);
        assert_eq!(p.net_salary, 3000.0);
        assert!(payroll_as_of(&conn, &e.id, 2024, 13, date("2024-02-10")).is_err());
    }

    #[test]
    fn test_delete_employee_removes_history() {
        let state = db::test_state();
        let e = create_employee(&state, new_employee("29001011234567")).unwrap();
        check_in(&state, &e.id, at("2024-02-01 09:00")).unwrap();
        delete_employee(&state, &e.id).unwrap();
        assert!(get_employee(&state, &e.id).is_err());
        let conn = state.conn.lock().unwrap();
        assert_eq!(db::count_rows(&conn, "attendance"), 0);
    }
}
