// External crates
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum GrokError {
    #[error("unknown grok pattern %{{{0}}}")]
    UnknownPattern(String),
    #[error("grok expansion exceeded depth limit in %{{{0}}}")]
    TooDeep(String),
    #[error("expanded grok pattern is not a valid regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Substitution never recurses deeper than this. The built-in library is
/// acyclic; the guard catches pathological user-supplied definitions.
const MAX_DEPTH: usize = 16;

/// Built-in pattern library. Names referenced via `%{NAME}` expand to
/// non-capturing groups, `%{NAME:field}` to named captures.
const LIBRARY: &[(&str, &str)] = &[
    ("WORD", r"\b\w+\b"),
    ("NOTSPACE", r"\S+"),
    ("SPACE", r"\s*"),
    ("DATA", r".*?"),
    ("GREEDYDATA", r".*"),
    ("INT", r"[+-]?[0-9]+"),
    ("POSINT", r"\b[1-9][0-9]*\b"),
    ("NONNEGINT", r"\b[0-9]+\b"),
    ("NUMBER", r"[+-]?[0-9]+(?:\.[0-9]+)?"),
    ("USER", r"[a-zA-Z0-9._-]+"),
    ("YEAR", r"(?:\d\d){1,2}"),
    ("MONTHNUM", r"(?:0?[1-9]|1[0-2])"),
    ("MONTHDAY", r"(?:0[1-9]|[12][0-9]|3[01]|[1-9])"),
    (
        "MONTH",
        r"\b(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|Jun(?:e)?|Jul(?:y)?|Aug(?:ust)?|Sep(?:tember)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)\b",
    ),
    ("HOUR", r"(?:2[0123]|[01]?[0-9])"),
    ("MINUTE", r"[0-5][0-9]"),
    ("SECOND", r"(?:[0-5]?[0-9]|60)(?:[:.,][0-9]+)?"),
    ("TIME", r"%{HOUR}:%{MINUTE}:%{SECOND}"),
    ("SYSLOGTIMESTAMP", r"%{MONTH} +%{MONTHDAY} %{TIME}"),
    (
        "TIMESTAMP_ISO8601",
        r"%{YEAR}-%{MONTHNUM}-%{MONTHDAY}[T ]%{HOUR}:%{MINUTE}(?::%{SECOND})?(?:Z|[+-]%{HOUR}:?%{MINUTE})?",
    ),
    ("HTTPDATE", r"%{MONTHDAY}/%{MONTH}/%{YEAR}:%{TIME} %{INT}"),
    (
        "IPV4",
        r"(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(?:\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)){3}",
    ),
    ("IP", r"%{IPV4}"),
    (
        "HOSTNAME",
        r"\b[0-9A-Za-z][0-9A-Za-z-]{0,62}(?:\.[0-9A-Za-z][0-9A-Za-z-]{0,62})*\.?\b",
    ),
    ("IPORHOST", r"(?:%{IP}|%{HOSTNAME})"),
    (
        "LOGLEVEL",
        r"(?:[Tt]race|TRACE|[Dd]ebug|DEBUG|[Ii]nfo|INFO|[Nn]otice|NOTICE|[Ww]arn(?:ing)?|WARN(?:ING)?|[Ee]rr(?:or)?|ERR(?:OR)?|[Cc]rit(?:ical)?|CRIT(?:ICAL)?|[Ff]atal|FATAL|[Ss]evere|SEVERE|[Pp]anic|PANIC)",
    ),
    ("QS", r#"(?:"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')"#),
    ("PROG", r"[\w._/%-]+"),
    ("SYSLOGPROG", r"%{PROG:program}(?:\[%{POSINT:pid}\])?"),
    ("SYSLOGHOST", r"%{IPORHOST}"),
    (
        "SYSLOGLINE",
        r"%{SYSLOGTIMESTAMP:timestamp} %{SYSLOGHOST:hostname} %{SYSLOGPROG}: %{GREEDYDATA:message}",
    ),
    (
        "COMMONAPACHELOG",
        r#"%{IPORHOST:clientip} %{USER:ident} %{USER:auth} \[%{HTTPDATE:timestamp}\] "(?:%{WORD:verb} %{NOTSPACE:request}(?: HTTP/%{NUMBER:httpversion})?|%{DATA:rawrequest})" %{NONNEGINT:response} (?:%{NONNEGINT:bytes}|-)"#,
    ),
    (
        "COMBINEDAPACHELOG",
        r"%{COMMONAPACHELOG} %{QS:referrer} %{QS:agent}",
    ),
    (
        "NGINXACCESS",
        r#"%{IPORHOST:remote_addr} - %{USER:remote_user} \[%{HTTPDATE:timestamp}\] "%{WORD:verb} %{NOTSPACE:request} HTTP/%{NUMBER:httpversion}" %{NONNEGINT:status} %{NONNEGINT:body_bytes_sent} %{QS:http_referer} %{QS:http_user_agent}"#,
    ),
    (
        "JAVACLASS",
        r"(?:[a-zA-Z$_][a-zA-Z$_0-9]*\.)*[a-zA-Z$_][a-zA-Z$_0-9]*",
    ),
    (
        "JAVALOG",
        r"%{TIMESTAMP_ISO8601:timestamp}\s+%{LOGLEVEL:level}\s+(?:\[%{DATA:thread}\]\s+)?%{JAVACLASS:class}(?:\s+-)?\s+%{GREEDYDATA:message}",
    ),
    (
        "PYTHONLOG",
        r"%{TIMESTAMP_ISO8601:timestamp},%{NONNEGINT:ms} - %{DATA:logger} - %{LOGLEVEL:level} - %{GREEDYDATA:message}",
    ),
    ("GODATE", r"%{YEAR}/%{MONTHNUM}/%{MONTHDAY} %{TIME}"),
    (
        "GOLOG",
        r"%{GODATE:timestamp} (?:%{NOTSPACE:file}:%{NONNEGINT:line}: )?%{GREEDYDATA:message}",
    ),
];

/// Short names accepted in configuration for whole-line library patterns.
const ALIASES: &[(&str, &str)] = &[
    ("syslog", "%{SYSLOGLINE}"),
    ("apache", "%{COMMONAPACHELOG}"),
    ("apache_combined", "%{COMBINEDAPACHELOG}"),
    ("nginx", "%{NGINXACCESS}"),
    ("java", "%{JAVALOG}"),
    ("python", "%{PYTHONLOG}"),
    ("go", "%{GOLOG}"),
];

fn lookup(name: &str) -> Option<&'static str> {
    LIBRARY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, pattern)| *pattern)
}

/// Compile a grok expression into an anchored regex. `pattern` is either a
/// configured alias (`syslog`, `apache`, ...) or an inline grok expression.
/// Unknown `%{NAME}` references fail here, at parser construction.
pub fn compile(pattern: &str) -> Result<Regex, GrokError> {
    let source = ALIASES
        .iter()
        .find(|(alias, _)| *alias == pattern)
        .map(|(_, expansion)| *expansion)
        .unwrap_or(pattern);
    let expanded = expand(source, 0)?;
    Ok(Regex::new(&format!("^{expanded}$"))?)
}

fn expand(pattern: &str, depth: usize) -> Result<String, GrokError> {
    lazy_static::lazy_static! {
        static ref REFERENCE: Regex =
            Regex::new(r"%\{(?P<name>\w+)(?::(?P<field>\w+))?\}").expect("static pattern");
    }

    let mut out = String::with_capacity(pattern.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(pattern) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps["name"];
        if depth >= MAX_DEPTH {
            return Err(GrokError::TooDeep(name.to_string()));
        }
        let definition = lookup(name).ok_or_else(|| GrokError::UnknownPattern(name.to_string()))?;
        let inner = expand(definition, depth + 1)?;

        out.push_str(&pattern[last..whole.start()]);
        match caps.name("field") {
            Some(field) => {
                out.push_str("(?P<");
                out.push_str(field.as_str());
                out.push('>');
                out.push_str(&inner);
                out.push(')');
            }
            None => {
                out.push_str("(?:");
                out.push_str(&inner);
                out.push(')');
            }
        }
        last = whole.end();
    }
    out.push_str(&pattern[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pattern_fails_at_compile() {
        let err = compile("%{NO_SUCH_PATTERN:x}").unwrap_err();
        assert!(matches!(err, GrokError::UnknownPattern(name) if name == "NO_SUCH_PATTERN"));
    }

    #[test]
    fn unnamed_reference_is_non_capturing() {
        let re = compile("%{INT} %{WORD:name}").unwrap();
        let caps = re.captures("42 hello").unwrap();
        assert_eq!(&caps["name"], "hello");
        assert_eq!(re.captures_len(), 2); // whole match + one named group
    }

    #[test]
    fn syslog_alias_extracts_program_and_message() {
        let re = compile("syslog").unwrap();
        let caps = re
            .captures("Jan 15 10:30:00 server1 myapp[1234]: Application started successfully")
            .unwrap();
        assert_eq!(&caps["timestamp"], "Jan 15 10:30:00");
        assert_eq!(&caps["hostname"], "server1");
        assert_eq!(&caps["program"], "myapp");
        assert_eq!(&caps["pid"], "1234");
        assert_eq!(&caps["message"], "Application started successfully");
    }

    #[test]
    fn syslog_without_pid_still_matches() {
        let re = compile("syslog").unwrap();
        let caps = re
            .captures("Feb  3 04:05:06 host cron: session opened")
            .unwrap();
        assert_eq!(&caps["program"], "cron");
        assert!(caps.name("pid").is_none());
    }

    #[test]
    fn apache_common_log_fields() {
        let re = compile("apache").unwrap();
        let caps = re
            .captures(r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /index.html HTTP/1.0" 200 2326"#)
            .unwrap();
        assert_eq!(&caps["clientip"], "127.0.0.1");
        assert_eq!(&caps["verb"], "GET");
        assert_eq!(&caps["request"], "/index.html");
        assert_eq!(&caps["response"], "200");
        assert_eq!(&caps["bytes"], "2326");
    }

    #[test]
    fn python_log_fields() {
        let re = compile("python").unwrap();
        let caps = re
            .captures("2026-01-15 10:30:00,123 - app.worker - ERROR - task exploded")
            .unwrap();
        assert_eq!(&caps["logger"], "app.worker");
        assert_eq!(&caps["level"], "ERROR");
        assert_eq!(&caps["message"], "task exploded");
    }

    #[test]
    fn go_log_fields() {
        let re = compile("go").unwrap();
        let caps = re
            .captures("2026/01/15 10:30:00 main.go:42: listener ready")
            .unwrap();
        assert_eq!(&caps["file"], "main.go");
        assert_eq!(&caps["line"], "42");
        assert_eq!(&caps["message"], "listener ready");
    }
}
