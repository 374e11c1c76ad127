//! Device command grammar.
//!
//! Commands travel as text (`input tap 10 20`, `am broadcast -a X --es k 'v'`),
//! but are parsed once into [`DeviceCommand`] at the backend boundary.
//! `Display` renders a command back into the same grammar, so
//! `DeviceCommand::parse(&cmd.to_string()) == cmd` for every non-raw variant.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    Component(String),
    Package(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastIntent {
    pub action: String,
    pub package: Option<String>,
    /// `--es KEY VALUE` string extras, in order.
    pub extras: Vec<(String, String)>,
    pub include_background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveQuery {
    pub brief: bool,
    pub action: Option<String>,
    pub category: Option<String>,
    pub package: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Tap { x: i32, y: i32 },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: Option<u64>,
    },
    KeyEvent { code: String },
    StartActivity(LaunchTarget),
    /// `screencap -p [-d N] [PATH]`. Without a path the PNG goes to stdout.
    Screencap {
        display: Option<u32>,
        path: Option<String>,
    },
    DumpWindow,
    ImeList { short: bool },
    ImeEnable(String),
    ImeSet(String),
    SettingsGet { namespace: String, key: String },
    Broadcast(BroadcastIntent),
    ResolveActivity(ResolveQuery),
    /// Anything outside the grammar; only a shell can run it.
    Raw(String),
}

impl DeviceCommand {
    pub fn parse(line: &str) -> Self {
        let tokens = tokenize(line);
        let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
        parse_words(&words).unwrap_or_else(|| DeviceCommand::Raw(line.trim().to_string()))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DeviceCommand::Raw(_))
    }

    /// Short name used in logs.
    pub fn verb(&self) -> &'static str {
        match self {
            DeviceCommand::Tap { .. } => "tap",
            DeviceCommand::Swipe { .. } => "swipe",
            DeviceCommand::KeyEvent { .. } => "keyevent",
            DeviceCommand::StartActivity(_) => "am_start",
            DeviceCommand::Screencap { .. } => "screencap",
            DeviceCommand::DumpWindow => "dumpsys_window",
            DeviceCommand::ImeList { .. } => "ime_list",
            DeviceCommand::ImeEnable(_) => "ime_enable",
            DeviceCommand::ImeSet(_) => "ime_set",
            DeviceCommand::SettingsGet { .. } => "settings_get",
            DeviceCommand::Broadcast(_) => "am_broadcast",
            DeviceCommand::ResolveActivity(_) => "pm_resolve_activity",
            DeviceCommand::Raw(_) => "raw",
        }
    }
}

fn parse_coord(s: &str) -> Option<i32> {
    s.parse::<i32>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i32))
}

fn parse_words(words: &[&str]) -> Option<DeviceCommand> {
    match words {
        ["input", "tap", x, y] => Some(DeviceCommand::Tap {
            x: parse_coord(x)?,
            y: parse_coord(y)?,
        }),
        ["input", "swipe", x1, y1, x2, y2, rest @ ..] if rest.len() <= 1 => {
            let duration_ms = match rest.first() {
                Some(d) => Some(d.parse().ok()?),
                None => None,
            };
            Some(DeviceCommand::Swipe {
                x1: parse_coord(x1)?,
                y1: parse_coord(y1)?,
                x2: parse_coord(x2)?,
                y2: parse_coord(y2)?,
                duration_ms,
            })
        }
        ["input", "keyevent", code] => Some(DeviceCommand::KeyEvent {
            code: code.to_string(),
        }),
        ["am", "start", "-n", component] => Some(DeviceCommand::StartActivity(
            LaunchTarget::Component(component.to_string()),
        )),
        ["am", "start", "-p", package] => Some(DeviceCommand::StartActivity(
            LaunchTarget::Package(package.to_string()),
        )),
        ["screencap", rest @ ..] => parse_screencap(rest),
        ["dumpsys", "window"] => Some(DeviceCommand::DumpWindow),
        ["ime", "list", "-s"] => Some(DeviceCommand::ImeList { short: true }),
        ["ime", "list"] => Some(DeviceCommand::ImeList { short: false }),
        ["ime", "enable", id] => Some(DeviceCommand::ImeEnable(id.to_string())),
        ["ime", "set", id] => Some(DeviceCommand::ImeSet(id.to_string())),
        ["settings", "get", namespace, key] => Some(DeviceCommand::SettingsGet {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }),
        ["am", "broadcast", rest @ ..] => parse_broadcast(rest),
        ["pm", "resolve-activity", rest @ ..] => parse_resolve(rest),
        _ => None,
    }
}

fn parse_screencap(args: &[&str]) -> Option<DeviceCommand> {
    let mut png = false;
    let mut display = None;
    let mut path = None;
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "-p" => png = true,
            "-d" => {
                display = Some(args.get(i + 1)?.parse().ok()?);
                i += 1;
            }
            flag if flag.starts_with('-') => return None,
            p if path.is_none() => path = Some(p.to_string()),
            _ => return None,
        }
        i += 1;
    }
    png.then_some(DeviceCommand::Screencap { display, path })
}

fn parse_broadcast(args: &[&str]) -> Option<DeviceCommand> {
    let mut intent = BroadcastIntent::default();
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "-a" => {
                intent.action = args.get(i + 1)?.to_string();
                i += 1;
            }
            "-p" => {
                intent.package = Some(args.get(i + 1)?.to_string());
                i += 1;
            }
            "--es" => {
                let key = args.get(i + 1)?.to_string();
                let value = args.get(i + 2)?.to_string();
                intent.extras.push((key, value));
                i += 2;
            }
            "--receiver-include-background" => intent.include_background = true,
            _ => return None,
        }
        i += 1;
    }
    if intent.action.is_empty() {
        return None;
    }
    Some(DeviceCommand::Broadcast(intent))
}

fn parse_resolve(args: &[&str]) -> Option<DeviceCommand> {
    let mut brief = false;
    let mut action = None;
    let mut category = None;
    let mut package = None;
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--brief" => brief = true,
            "-a" => {
                action = Some(args.get(i + 1)?.to_string());
                i += 1;
            }
            "-c" => {
                category = Some(args.get(i + 1)?.to_string());
                i += 1;
            }
            flag if flag.starts_with('-') => return None,
            p if package.is_none() => package = Some(p.to_string()),
            _ => return None,
        }
        i += 1;
    }
    Some(DeviceCommand::ResolveActivity(ResolveQuery {
        brief,
        action,
        category,
        package: package?,
    }))
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Tap { x, y } => write!(f, "input tap {x} {y}"),
            DeviceCommand::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                write!(f, "input swipe {x1} {y1} {x2} {y2}")?;
                if let Some(d) = duration_ms {
                    write!(f, " {d}")?;
                }
                Ok(())
            }
            DeviceCommand::KeyEvent { code } => write!(f, "input keyevent {}", quote_arg(code)),
            DeviceCommand::StartActivity(LaunchTarget::Component(c)) => {
                write!(f, "am start -n {}", quote_arg(c))
            }
            DeviceCommand::StartActivity(LaunchTarget::Package(p)) => {
                write!(f, "am start -p {}", quote_arg(p))
            }
            DeviceCommand::Screencap { display, path } => {
                f.write_str("screencap -p")?;
                if let Some(d) = display {
                    write!(f, " -d {d}")?;
                }
                if let Some(p) = path {
                    write!(f, " {}", quote_arg(p))?;
                }
                Ok(())
            }
            DeviceCommand::DumpWindow => f.write_str("dumpsys window"),
            DeviceCommand::ImeList { short: true } => f.write_str("ime list -s"),
            DeviceCommand::ImeList { short: false } => f.write_str("ime list"),
            DeviceCommand::ImeEnable(id) => write!(f, "ime enable {}", quote_arg(id)),
            DeviceCommand::ImeSet(id) => write!(f, "ime set {}", quote_arg(id)),
            DeviceCommand::SettingsGet { namespace, key } => {
                write!(f, "settings get {} {}", quote_arg(namespace), quote_arg(key))
            }
            DeviceCommand::Broadcast(intent) => {
                write!(f, "am broadcast -a {}", quote_arg(&intent.action))?;
                if let Some(p) = &intent.package {
                    write!(f, " -p {}", quote_arg(p))?;
                }
                for (k, v) in &intent.extras {
                    write!(f, " --es {} {}", quote_arg(k), quote_value(v))?;
                }
                if intent.include_background {
                    f.write_str(" --receiver-include-background")?;
                }
                Ok(())
            }
            DeviceCommand::ResolveActivity(q) => {
                f.write_str("pm resolve-activity")?;
                if q.brief {
                    f.write_str(" --brief")?;
                }
                if let Some(a) = &q.action {
                    write!(f, " -a {}", quote_arg(a))?;
                }
                if let Some(c) = &q.category {
                    write!(f, " -c {}", quote_arg(c))?;
                }
                write!(f, " {}", quote_arg(&q.package))
            }
            DeviceCommand::Raw(line) => f.write_str(line),
        }
    }
}

fn is_plain(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:=,+-@%".contains(c))
}

pub fn quote_arg(s: &str) -> String {
    if is_plain(s) {
        s.to_string()
    } else {
        quote_value(s)
    }
}

/// Quote a value for `sh`. Extras are always quoted so the rendered text
/// keeps the `--es KEY 'VALUE'` shape.
pub fn quote_value(s: &str) -> String {
    if s.contains('\\') {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('"');
        for c in s.chars() {
            if matches!(c, '\\' | '"' | '$' | '`') {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Split a command line into words, honoring single and double quotes.
///
/// Backslashes follow `sh`: literal inside single quotes, escaping only
/// `$`, backtick, `"` and `\` inside double quotes, escaping any character
/// outside quotes. Adjacent quoted and unquoted runs join into one word.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quote) {
            ('\\', Some('\'')) => current.push(c),
            ('\\', q) => {
                let escapable = match q {
                    Some(_) => matches!(chars.peek().copied(), Some('$' | '`' | '"' | '\\')),
                    None => chars.peek().is_some(),
                };
                if escapable {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else {
                    current.push('\\');
                }
                in_token = true;
            }
            ('\'' | '"', None) => {
                quote = Some(c);
                in_token = true;
            }
            (c, Some(q)) if c == q => quote = None,
            (c, None) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (c, _) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_quotes_and_escapes() {
        assert_eq!(
            tokenize(r#"am broadcast --es msg 'value with spaces' --es k "a \"b\" c""#),
            vec!["am", "broadcast", "--es", "msg", "value with spaces", "--es", "k", r#"a "b" c"#]
        );
        assert_eq!(tokenize(r"echo it\'s"), vec!["echo", "it's"]);
        assert_eq!(tokenize(r#"x "it's" 'say "hi"'"#), vec!["x", "it's", r#"say "hi""#]);
        assert_eq!(tokenize("a '' b"), vec!["a", "", "b"]);
        assert_eq!(tokenize(r"path C:\dir"), vec!["path", "C:dir"]);
        assert_eq!(tokenize(r#"p "C:\dir""#), vec!["p", r"C:\dir"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn backslash_is_literal_in_single_quotes() {
        assert_eq!(tokenize(r"echo 'a\'b'"), vec!["echo", r"a\b"]);
        assert_eq!(tokenize(r"echo 'a\nb'"), vec!["echo", r"a\nb"]);
        assert_eq!(tokenize(r#"echo "a\'b""#), vec!["echo", r"a\'b"]);
    }

    #[test]
    fn parses_input_commands() {
        assert_eq!(DeviceCommand::parse("input tap 10 20"), DeviceCommand::Tap { x: 10, y: 20 });
        assert_eq!(
            DeviceCommand::parse("input swipe 1 2 3 4 500"),
            DeviceCommand::Swipe { x1: 1, y1: 2, x2: 3, y2: 4, duration_ms: Some(500) }
        );
        assert_eq!(
            DeviceCommand::parse("input swipe 1 2 3 4"),
            DeviceCommand::Swipe { x1: 1, y1: 2, x2: 3, y2: 4, duration_ms: None }
        );
        assert_eq!(
            DeviceCommand::parse("input keyevent 4"),
            DeviceCommand::KeyEvent { code: "4".into() }
        );
        assert!(DeviceCommand::parse("input tap ten 20").is_raw());
    }

    #[test]
    fn parses_activity_and_screencap() {
        assert_eq!(
            DeviceCommand::parse("am start -n com.a/.Main"),
            DeviceCommand::StartActivity(LaunchTarget::Component("com.a/.Main".into()))
        );
        assert_eq!(
            DeviceCommand::parse("screencap -p -d 1 /sdcard/s.png"),
            DeviceCommand::Screencap { display: Some(1), path: Some("/sdcard/s.png".into()) }
        );
        assert_eq!(
            DeviceCommand::parse("screencap -p"),
            DeviceCommand::Screencap { display: None, path: None }
        );
        assert!(DeviceCommand::parse("screencap /sdcard/s.raw").is_raw());
    }

    #[test]
    fn parses_broadcast_with_quoted_extra() {
        let cmd = DeviceCommand::parse(
            "am broadcast -a ADB_INPUT_B64 -p com.android.adbkeyboard --es msg 'hello world' --receiver-include-background",
        );
        let DeviceCommand::Broadcast(intent) = cmd else {
            panic!("expected broadcast");
        };
        assert_eq!(intent.action, "ADB_INPUT_B64");
        assert_eq!(intent.package.as_deref(), Some("com.android.adbkeyboard"));
        assert_eq!(intent.extras, vec![("msg".to_string(), "hello world".to_string())]);
        assert!(intent.include_background);
    }

    #[test]
    fn parses_resolve_activity() {
        let cmd = DeviceCommand::parse(
            "pm resolve-activity --brief -a android.intent.action.MAIN -c android.intent.category.LAUNCHER com.a",
        );
        assert_eq!(
            cmd,
            DeviceCommand::ResolveActivity(ResolveQuery {
                brief: true,
                action: Some("android.intent.action.MAIN".into()),
                category: Some("android.intent.category.LAUNCHER".into()),
                package: "com.a".into(),
            })
        );
    }

    #[test]
    fn render_reparses_to_same_command() {
        let commands = vec![
            DeviceCommand::Tap { x: 5, y: 6 },
            DeviceCommand::Swipe { x1: 1, y1: 2, x2: 3, y2: 4, duration_ms: Some(300) },
            DeviceCommand::Screencap { display: None, path: Some("/data/local/tmp/a b.png".into()) },
            DeviceCommand::SettingsGet { namespace: "secure".into(), key: "default_input_method".into() },
            DeviceCommand::Broadcast(BroadcastIntent {
                action: "ADB_INPUT_TEXT".into(),
                package: None,
                extras: vec![("msg".into(), "it's a \"test\"".into()), ("path".into(), r"a\b".into())],
                include_background: false,
            }),
        ];
        for cmd in commands {
            let text = cmd.to_string();
            assert_eq!(DeviceCommand::parse(&text), cmd, "round trip of {text}");
        }
    }

    #[test]
    fn unknown_command_stays_raw() {
        let cmd = DeviceCommand::parse("getevent -pl");
        assert_eq!(cmd, DeviceCommand::Raw("getevent -pl".into()));
        assert_eq!(cmd.to_string(), "getevent -pl");
    }
}
