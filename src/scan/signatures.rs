//! Text signatures shared by passive and active checks.

const SQL_ERRORS: &[&str] = &[
  "you have an error in your sql syntax",
  "warning: mysql",
  "unclosed quotation mark after the character string",
  "quoted string not properly terminated",
  "pg::syntaxerror",
  "syntax error at or near",
  "sqlite3::sqlexception",
  "sqlite_error",
  "ora-00933",
  "ora-01756",
  "microsoft ole db provider for sql server",
  "sqlstate[",
];

const STACK_TRACES: &[&str] = &[
  "traceback (most recent call last)",
  "exception in thread \"main\"",
  "at java.lang.",
  "system.nullreferenceexception",
  "stack trace:",
  "fatal error: uncaught",
  "panicked at",
];

const TRAVERSAL_CONTENT: &[&str] = &["root:x:0:0:", "[boot loader]", "[extensions]"];

fn find(haystack: &str, needles: &'static [&'static str]) -> Option<&'static str> {
  let lower = haystack.to_ascii_lowercase();
  needles.iter().copied().find(|n| lower.contains(&n.to_ascii_lowercase()))
}

pub fn find_sql_error(body: &str) -> Option<&'static str> {
  find(body, SQL_ERRORS)
}

pub fn find_stack_trace(body: &str) -> Option<&'static str> {
  find(body, STACK_TRACES)
}

/// Contents of well-known system files.
pub fn find_system_file(body: &str) -> Option<&'static str> {
  find(body, TRAVERSAL_CONTENT)
}
