//! Project files.
//!
//! A project is one XML document per scope: metadata, the room's link
//! ports, the live-graph snapshot, the virtual graph with its connections
//! and applications, and the graph's property map. Files are written next
//! to their final name and renamed into place.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::dict::Dict;
use crate::graph::{Graph, Port};
use crate::supervisor::AppSupervisor;

pub const PROJECT_FILE: &str = "greenroom-project.xml";
const HEADER_TEXT: &str = "Greenroom Project.";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("cannot save unnamed project in {0}")]
    Unnamed(String),

    #[error("cannot derive a project name from '{0}'")]
    BadDir(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Project metadata of one scope. Name and dir are set together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectInfo {
    pub name: Option<String>,
    pub dir: Option<PathBuf>,
    pub uuid: Option<Uuid>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

impl ProjectInfo {
    pub fn file(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(PROJECT_FILE))
    }
}

fn supplied(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Name and directory for the next save.
///
/// The first save needs a name or a dir; the missing one is derived. Later
/// saves keep the current values unless overridden.
pub fn resolve_target(
    current: &ProjectInfo,
    scope: &str,
    dir: Option<&str>,
    name: Option<&str>,
    projects_dir: &Path,
) -> Result<(String, PathBuf), ProjectError> {
    let (dir, name) = (supplied(dir), supplied(name));

    if let (Some(cur_name), Some(cur_dir)) = (&current.name, &current.dir) {
        let name = name.map(str::to_string).unwrap_or_else(|| cur_name.clone());
        let dir = dir.map(PathBuf::from).unwrap_or_else(|| cur_dir.clone());
        return Ok((name, dir));
    }

    match (dir, name) {
        (None, None) => Err(ProjectError::Unnamed(scope.to_string())),
        (Some(dir), Some(name)) => Ok((name.to_string(), PathBuf::from(dir))),
        (Some(dir), None) => {
            let name = Path::new(dir)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ProjectError::BadDir(dir.to_string()))?;
            info!(dir, name = %name, "project name derived from dir");
            Ok((name, PathBuf::from(dir)))
        }
        (None, Some(name)) => {
            let dir = projects_dir.join(escape_file_name(name));
            info!(name, dir = %dir.display(), "project dir derived from name");
            Ok((name.to_string(), dir))
        }
    }
}

/// Make a project name usable as a single path component.
pub fn escape_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        let escape = matches!(c, '/' | '\\' | '%') || c.is_control() || (i == 0 && c == '.');
        if escape {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{:02X}", b);
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `ctime`-style stamp, e.g. `Mon Oct 19 09:05:01 2026`.
pub fn ctime(at: &DateTime<Local>) -> String {
    at.format("%a %b %e %H:%M:%S %Y").to_string()
}

/// Everything that goes into one project file.
pub struct ProjectDocument<'a> {
    pub name: &'a str,
    pub uuid: Uuid,
    pub description: Option<&'a str>,
    pub notes: Option<&'a str>,
    /// Boundary ports of a room; empty for the studio.
    pub link_ports: Vec<&'a Port>,
    pub graph: &'a Graph,
    pub supervisor: &'a AppSupervisor,
}

struct Xml {
    out: String,
}

impl Xml {
    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }
}

fn port_attrs(port: &Port) -> String {
    let direction = if port.flags.input { "input" } else { "output" };
    let mut attrs = format!(
        "name=\"{}\" uuid=\"{}\" type=\"{}\" direction=\"{}\"",
        xml_escape(&port.name),
        port.uuid,
        port.port_type,
        direction
    );
    if port.flags.terminal {
        attrs.push_str(" terminal=\"true\"");
    }
    if let Some(link) = port.link_override {
        let _ = write!(attrs, " link_uuid=\"{}\"", link);
    }
    attrs
}

fn write_dict(xml: &mut Xml, depth: usize, dict: &Dict) {
    if dict.is_empty() {
        return;
    }
    xml.line(depth, "<dict>");
    for (key, value) in dict.iter() {
        xml.line(
            depth + 1,
            &format!("<key name=\"{}\">{}</key>", xml_escape(key), xml_escape(value)),
        );
    }
    xml.line(depth, "</dict>");
}

impl ProjectDocument<'_> {
    pub fn render(&self, timestamp: &str) -> String {
        let mut xml = Xml { out: String::new() };
        xml.line(0, "<?xml version=\"1.0\"?>");
        xml.line(0, "<!--");
        xml.line(0, HEADER_TEXT);
        xml.line(0, "-->");
        xml.line(0, &format!("<!-- {} -->", timestamp));
        xml.line(
            0,
            &format!("<project name=\"{}\" uuid=\"{}\">", xml_escape(self.name), self.uuid),
        );
        if let Some(description) = self.description {
            xml.line(1, &format!("<description>{}</description>", xml_escape(description)));
        }
        if let Some(notes) = self.notes {
            xml.line(1, &format!("<notes>{}</notes>", xml_escape(notes)));
        }

        xml.line(1, "<room>");
        for port in &self.link_ports {
            xml.line(2, &format!("<port {}/>", port_attrs(port)));
        }
        xml.line(1, "</room>");

        self.write_live_graph(&mut xml);
        self.write_virtual_graph(&mut xml);
        write_dict(&mut xml, 1, self.graph.dict());
        xml.line(0, "</project>");
        xml.out
    }

    fn write_live_graph(&self, xml: &mut Xml) {
        xml.line(1, "<jack>");
        xml.line(2, "<clients>");
        for client in self.graph.clients().filter(|c| c.live_id.is_some()) {
            xml.line(
                3,
                &format!("<client name=\"{}\" uuid=\"{}\">", xml_escape(&client.name), client.uuid),
            );
            for port in self.graph.client_ports(client.id) {
                xml.line(
                    4,
                    &format!("<port name=\"{}\" uuid=\"{}\"/>", xml_escape(&port.name), port.uuid),
                );
            }
            xml.line(3, "</client>");
        }
        xml.line(2, "</clients>");
        xml.line(1, "</jack>");
    }

    fn write_virtual_graph(&self, xml: &mut Xml) {
        xml.line(1, "<clients>");
        for client in self.graph.clients() {
            let app = client
                .app_uuid
                .map(|u| format!(" app=\"{}\"", u))
                .unwrap_or_default();
            xml.line(
                2,
                &format!(
                    "<client name=\"{}\" uuid=\"{}\"{}>",
                    xml_escape(&client.name),
                    client.uuid,
                    app
                ),
            );
            xml.line(3, "<ports>");
            for port in self.graph.client_ports(client.id) {
                xml.line(4, &format!("<port {}/>", port_attrs(port)));
            }
            xml.line(3, "</ports>");
            xml.line(2, "</client>");
        }
        xml.line(1, "</clients>");

        xml.line(1, "<connections>");
        let _ = self.graph.iterate_connections(|c| {
            let open = format!("<connection port1=\"{}\" port2=\"{}\"", c.port1.uuid, c.port2.uuid);
            if c.dict.is_empty() {
                xml.line(2, &format!("{}/>", open));
            } else {
                xml.line(2, &format!("{}>", open));
                write_dict(xml, 3, c.dict);
                xml.line(2, "</connection>");
            }
            ControlFlow::Continue(())
        });
        xml.line(1, "</connections>");

        xml.line(1, "<applications>");
        let _ = self.supervisor.enumerate(|app| {
            xml.line(
                2,
                &format!(
                    "<application name=\"{}\" uuid=\"{}\" terminal=\"{}\" level=\"{}\" autorun=\"{}\">{}</application>",
                    xml_escape(&app.name),
                    app.uuid,
                    app.terminal,
                    app.level,
                    app.is_running(),
                    xml_escape(&app.commandline)
                ),
            );
            ControlFlow::Continue(())
        });
        xml.line(1, "</applications>");
    }
}

/// Write `contents` as the project file in `dir`, creating `dir` if needed.
pub fn write_atomic(dir: &Path, contents: &str) -> Result<PathBuf, ProjectError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ProjectError::Io { path, source }
    };

    fs::create_dir_all(dir).map_err(io(dir))?;
    let path = dir.join(PROJECT_FILE);
    let tmp = dir.join(format!("{}.tmp", PROJECT_FILE));

    let mut file = fs::File::create(&tmp).map_err(io(&tmp))?;
    file.write_all(contents.as_bytes()).map_err(io(&tmp))?;
    file.sync_all().map_err(io(&tmp))?;
    drop(file);

    fs::rename(&tmp, &path).map_err(io(&path))?;
    info!(path = %path.display(), "project written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewPort;
    use crate::notify::NoOpSink;
    use crate::supervisor::testing::{RecordingControl, ScriptedLoader, ScriptedRich};
    use crate::supervisor::ProcessHost;
    use greenproto::{PortFlags, PortType, Scope};
    use std::sync::Arc;

    fn supervisor() -> AppSupervisor {
        let host = ProcessHost {
            loader: ScriptedLoader::with_pids(&[]),
            control: RecordingControl::new(),
            rich: ScriptedRich::new(false),
            sink: Arc::new(NoOpSink),
            base_dir: std::env::temp_dir(),
        };
        AppSupervisor::new("studio", Scope::Studio, host)
    }

    #[test]
    fn test_first_save_needs_name_or_dir() {
        let info = ProjectInfo::default();
        let base = Path::new("/home/u/greenroom-projects");
        assert!(matches!(
            resolve_target(&info, "/studio", None, Some(""), base),
            Err(ProjectError::Unnamed(_))
        ));

        let (name, dir) = resolve_target(&info, "/studio", None, Some("My/Song"), base).unwrap();
        assert_eq!(name, "My/Song");
        assert_eq!(dir, base.join("My%2FSong"));

        let (name, dir) = resolve_target(&info, "/studio", Some("/tmp/gig"), None, base).unwrap();
        assert_eq!((name.as_str(), dir), ("gig", PathBuf::from("/tmp/gig")));
    }

    #[test]
    fn test_later_save_keeps_or_overrides() {
        let info = ProjectInfo {
            name: Some("gig".into()),
            dir: Some("/tmp/gig".into()),
            ..Default::default()
        };
        let base = Path::new("/unused");
        let (name, dir) = resolve_target(&info, "/studio", None, None, base).unwrap();
        assert_eq!((name.as_str(), dir.as_path()), ("gig", Path::new("/tmp/gig")));

        let (name, dir) = resolve_target(&info, "/studio", None, Some("encore"), base).unwrap();
        assert_eq!((name.as_str(), dir.as_path()), ("encore", Path::new("/tmp/gig")));
    }

    #[test]
    fn test_escape_file_name() {
        assert_eq!(escape_file_name("plain name"), "plain name");
        assert_eq!(escape_file_name("a/b\\c%"), "a%2Fb%5Cc%25");
        assert_eq!(escape_file_name(".."), "%2E.");
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&apos;");
    }

    #[test]
    fn test_document_layout() {
        let mut graph = Graph::new(Scope::Studio, Arc::new(NoOpSink));
        let synth = graph.add_client("synth", None, false);
        let out = graph
            .add_port(synth, NewPort::new("out", PortType::Audio, PortFlags::output()).with_live_id(5))
            .unwrap();
        graph.set_client_live_id(synth, Some(3)).unwrap();
        let mixer = graph.add_client("mixer", None, false);
        let inp = graph
            .add_port(mixer, NewPort::new("in", PortType::Audio, PortFlags::input()))
            .unwrap();
        let conn = graph.add_connection(out, inp, false).unwrap();
        graph.connection_dict_mut(conn).unwrap().set("gain", "0.5");
        graph.dict_mut().set("tempo", "120");

        let mut sup = supervisor();
        sup.add("Synth & Co", None, "zynaddsubfx -U", true, "1", false).unwrap();

        let doc = ProjectDocument {
            name: "gig",
            uuid: Uuid::nil(),
            description: Some("first <set>"),
            notes: None,
            link_ports: Vec::new(),
            graph: &graph,
            supervisor: &sup,
        };
        let text = doc.render("Mon Oct 19 09:05:01 2026");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "<?xml version=\"1.0\"?>");
        assert_eq!(lines[4], "<!-- Mon Oct 19 09:05:01 2026 -->");
        assert_eq!(lines[5], "<project name=\"gig\" uuid=\"00000000-0000-0000-0000-000000000000\">");
        assert_eq!(lines[6], "  <description>first &lt;set&gt;</description>");
        assert_eq!(lines.last(), Some(&"</project>"));

        let order = ["<room>", "<jack>", "<clients>", "<connections>", "<applications>", "<dict>"];
        let positions: Vec<usize> = order
            .iter()
            .map(|tag| lines.iter().position(|l| *l == format!("  {}", tag)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(text.contains("<key name=\"gain\">0.5</key>"));
        assert!(text.contains("<key name=\"tempo\">120</key>"));
        assert!(text.contains("name=\"Synth &amp; Co\""));
        assert!(text.contains("level=\"1\" autorun=\"false\">zynaddsubfx -U</application>"));

        // only the live client is in the live snapshot
        let jack_start = positions[1];
        let jack_end = lines.iter().position(|l| l.trim() == "</jack>").unwrap();
        let jack = lines[jack_start..jack_end].join("\n");
        assert!(jack.contains("synth"));
        assert!(!jack.contains("mixer"));
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");

        let path = write_atomic(&target, "one").unwrap();
        assert_eq!(path, target.join(PROJECT_FILE));
        write_atomic(&target, "two").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!target.join(format!("{}.tmp", PROJECT_FILE)).exists());
    }

    #[test]
    fn test_ctime_shape() {
        let stamp = ctime(&Local::now());
        assert_eq!(stamp.len(), 24);
    }
}
