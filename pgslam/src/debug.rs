//! Human-readable renderings of statements and remote commands for logs.
use crate::db::SqlValue;

/// Render `sql` with every `$N` placeholder replaced by the literal of `params[N-1]`.
///
/// Placeholders without a matching parameter are left as written.
pub fn debug_sql(sql: &str, params: &[SqlValue]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();

        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));

        match param {
            Some(value) => out.push_str(&literal(value)),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

fn literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Text(s) => quote_literal(s),
        SqlValue::Uuid(id) => quote_literal(&id.to_string()),
    }
}

/// Quote `s` as a SQL string literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Render a command line the way a shell would need it typed.
pub fn debug_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(AsRef::as_ref))
        .map(|arg| match shlex::try_quote(arg) {
            Ok(quoted) => quoted.into_owned(),
            Err(_) => format!("{arg:?}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_placeholders() {
        let sql = debug_sql(
            "update t set c = $1 where id = $2",
            &[SqlValue::text("it's"), SqlValue::Int(42)],
        );
        assert_eq!(sql, "update t set c = 'it''s' where id = 42");
    }

    #[test]
    fn multi_digit_placeholders() {
        let params: Vec<_> = (1..=12).map(SqlValue::Int).collect();
        assert_eq!(debug_sql("$1,$12,$10", &params), "1,12,10");
    }

    #[test]
    fn unmatched_placeholders_are_kept() {
        assert_eq!(
            debug_sql("select $3, $0, $ from t", &[SqlValue::Int(1)]),
            "select $3, $0, $ from t"
        );
    }

    #[test]
    fn quotes_commands() {
        let line = debug_command("ssh", &["db1", "rm -rf", "a'b"]);
        assert!(line.starts_with("ssh db1 "));
        assert_eq!(
            shlex::split(&line).unwrap(),
            vec!["ssh", "db1", "rm -rf", "a'b"]
        );
    }
}
