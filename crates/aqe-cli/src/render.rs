use aqe_core::{LearningStats, QueryResponse, QueryResult, Value};
use comfy_table::{Cell, Table};

fn fmt_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Float(v) => format!("{v:.2}"),
        other => other.to_string(),
    }
}

fn fmt_pct(v: f64) -> String {
    format!("{:.2}%", v * 100.0)
}

pub fn result_table(result: &QueryResult) -> Table {
    let mut table = Table::new();
    match result {
        QueryResult::Aggregate {
            column,
            group_columns,
            groups,
        } => {
            let mut headers: Vec<String> = group_columns.clone();
            headers.push(column.clone());
            headers.push("interval".to_string());
            headers.push("rel. error".to_string());
            table.set_header(headers);
            for group in groups {
                let mut row: Vec<Cell> = group.key.iter().map(|k| Cell::new(fmt_value(k))).collect();
                row.push(Cell::new(fmt_value(&group.value)));
                row.push(Cell::new(match &group.interval {
                    Some(ci) => format!(
                        "[{:.2}, {:.2}] @ {:.0}%",
                        ci.lower,
                        ci.upper,
                        ci.level * 100.0
                    ),
                    None => "exact".to_string(),
                }));
                row.push(Cell::new(fmt_pct(group.relative_error)));
                table.add_row(row);
            }
        }
        QueryResult::Rows { columns, rows } => {
            table.set_header(columns.clone());
            for row in rows {
                table.add_row(row.iter().map(|v| Cell::new(fmt_value(v))).collect::<Vec<_>>());
            }
        }
    }
    table
}

pub fn response_summary(resp: &QueryResponse) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["", ""]);
    table.add_row(vec!["strategy".to_string(), resp.strategy_used.to_string()]);
    table.add_row(vec![
        "confidence".to_string(),
        format!("{:.2}", resp.decision.confidence),
    ]);
    table.add_row(vec!["reasoning".to_string(), resp.decision.reasoning.clone()]);
    if !resp.decision.transformations.is_empty() {
        table.add_row(vec![
            "transformations".to_string(),
            resp.decision.transformations.join("\n"),
        ]);
    }
    if let Some(reason) = &resp.downgraded {
        table.add_row(vec!["downgraded".to_string(), reason.clone()]);
    }
    table.add_row(vec![
        "time".to_string(),
        format!("{:.2} ms", resp.timings.strategy_millis),
    ]);
    if let Some(exact) = resp.timings.exact_millis {
        table.add_row(vec!["exact time".to_string(), format!("{exact:.2} ms")]);
    }
    if let Some(speedup) = resp.timings.measured_speedup {
        table.add_row(vec!["speedup".to_string(), format!("{speedup:.1}x")]);
    }
    table.add_row(vec!["error estimate".to_string(), fmt_pct(resp.error_estimate)]);
    if let Some(err) = resp.measured_relative_error {
        table.add_row(vec!["measured error".to_string(), fmt_pct(err)]);
    }
    table
}

pub fn workload_table(runs: &[(usize, &str, QueryResponse)]) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "pass", "query", "strategy", "confidence", "ms", "speedup", "error",
    ]);
    for (pass, sql, resp) in runs {
        table.add_row(vec![
            pass.to_string(),
            sql.to_string(),
            resp.strategy_used.to_string(),
            format!("{:.2}", resp.decision.confidence),
            format!("{:.2}", resp.timings.strategy_millis),
            resp.timings
                .measured_speedup
                .map_or_else(|| "-".to_string(), |s| format!("{s:.1}x")),
            fmt_pct(
                resp.measured_relative_error
                    .unwrap_or(resp.error_estimate),
            ),
        ]);
    }
    table
}

pub fn stats_table(stats: &LearningStats) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "strategy",
        "queries",
        "avg speedup",
        "avg error",
        "confidence",
    ]);
    for s in &stats.per_strategy {
        table.add_row(vec![
            s.strategy.to_string(),
            s.observations.to_string(),
            format!("{:.1}x", s.mean_speedup),
            fmt_pct(s.mean_relative_error),
            format!("{:.2}", s.confidence),
        ]);
    }
    table.add_row(vec![
        "total (all time)".to_string(),
        stats.total_historical_queries.to_string(),
        String::new(),
        String::new(),
        String::new(),
    ]);
    table
}
