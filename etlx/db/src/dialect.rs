/// Rewrite placeholder and identifier quoting for the target dialect.
///
/// - postgres: `?` becomes `$1`, `$2`, ...
/// - mysql: double quotes become backticks
/// - mssql / sqlserver: double quotes are dropped
pub fn adjust_query(driver: &str, query: &str) -> String {
    match driver {
        "postgres" | "postgresql" | "pgx" => {
            let mut count = 0;
            let mut out = String::with_capacity(query.len() + 8);
            for ch in query.chars() {
                if ch == '?' {
                    count += 1;
                    out.push('$');
                    out.push_str(&count.to_string());
                } else {
                    out.push(ch);
                }
            }
            out
        }
        "mysql" => query.replace('"', "`"),
        "mssql" | "sqlserver" => query.replace('"', ""),
        _ => query.to_string(),
    }
}
