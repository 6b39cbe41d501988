use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{Datelike, Local, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::employees::{
    self, AttendanceFilter, AttendanceRecord, Deduction, Employee, PayrollSummary,
};
use crate::error::AppResult;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/employees", get(list).post(create))
        .route("/api/employees/attendance", get(list_attendance))
        .route("/api/employees/deductions", get(list_deductions).post(add_deduction))
        .route(
            "/api/employees/deductions/{id}",
            patch(update_deduction).delete(delete_deduction),
        )
        .route("/api/employees/payroll", get(payroll_all))
        .route(
            "/api/employees/{id}",
            get(get_by_id).patch(update).delete(delete),
        )
        .route("/api/employees/{id}/check-in", post(check_in))
        .route("/api/employees/{id}/check-out", post(check_out))
        .route("/api/employees/{id}/payroll", get(payroll))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListQuery {
    include_inactive: bool,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Employee>>> {
    Ok(Json(employees::list_employees(&state.db, query.include_inactive)?))
}

async fn get_by_id(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Employee>> {
    Ok(Json(employees::get_employee(&state.db, &id)?))
}

async fn create(
    State(state): State<AppState>,
    Json(employee): Json<Employee>,
) -> AppResult<(StatusCode, Json<Employee>)> {
    let employee = employees::create_employee(&state.db, employee)?;
    Ok((StatusCode::CREATED, Json(employee)))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Employee>> {
    Ok(Json(employees::update_employee(&state.db, &id, &patch)?))
}

async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    employees::delete_employee(&state.db, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Clock event; `at` defaults to the local wall clock.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClockRequest {
    at: Option<NaiveDateTime>,
}

fn clock_time(body: Option<Json<ClockRequest>>) -> NaiveDateTime {
    body.and_then(|Json(b)| b.at)
        .unwrap_or_else(|| Local::now().naive_local())
}

async fn check_in(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ClockRequest>>,
) -> AppResult<Json<AttendanceRecord>> {
    Ok(Json(employees::check_in(&state.db, &id, clock_time(body))?))
}

async fn check_out(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ClockRequest>>,
) -> AppResult<Json<AttendanceRecord>> {
    Ok(Json(employees::check_out(&state.db, &id, clock_time(body))?))
}

async fn list_attendance(
    State(state): State<AppState>,
    Query(filter): Query<AttendanceFilter>,
) -> AppResult<Json<Vec<AttendanceRecord>>> {
    Ok(Json(employees::list_attendance(&state.db, &filter)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeductionQuery {
    employee_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

async fn list_deductions(
    State(state): State<AppState>,
    Query(query): Query<DeductionQuery>,
) -> AppResult<Json<Vec<Deduction>>> {
    Ok(Json(employees::list_deductions(
        &state.db,
        query.employee_id.as_deref(),
        query.from.as_deref(),
        query.to.as_deref(),
    )?))
}

async fn add_deduction(
    State(state): State<AppState>,
    Json(deduction): Json<Deduction>,
) -> AppResult<(StatusCode, Json<Deduction>)> {
    let deduction = employees::add_deduction(&state.db, deduction)?;
    Ok((StatusCode::CREATED, Json(deduction)))
}

async fn update_deduction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Deduction>> {
    Ok(Json(employees::update_deduction(&state.db, &id, &patch)?))
}

async fn delete_deduction(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    employees::delete_deduction(&state.db, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Month selector; the current month when absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MonthQuery {
    year: Option<i32>,
    month: Option<u32>,
}

impl MonthQuery {
    fn resolve(&self) -> (i32, u32) {
        let today = Local::now().date_naive();
        (
            self.year.unwrap_or(today.year()),
            self.month.unwrap_or(today.month()),
        )
    }
}

async fn payroll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MonthQuery>,
) -> AppResult<Json<PayrollSummary>> {
    let (year, month) = query.resolve();
    Ok(Json(employees::payroll(&state.db, &id, year, month)?))
}

async fn payroll_all(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> AppResult<Json<Vec<PayrollSummary>>> {
    let (year, month) = query.resolve();
    Ok(Json(employees::payroll_all(&state.db, year, month)?))
}
