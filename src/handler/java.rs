use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

const GRADLE_FILES: &[&str] = &["build.gradle", "build.gradle.kts"];
const SETTINGS_FILES: &[&str] = &["settings.gradle", "settings.gradle.kts"];
const RECOVERED_GRADLE: &str = "build.recovered.gradle";

/// Package prefix → Maven coordinate for imports whose coordinates cannot
/// be guessed from the package name. Longest prefix wins.
const IMPORT_COORDINATES: &[(&str, &str, &str)] = &[
    ("org.springframework", "org.springframework", "spring-context"),
    ("org.springframework.web", "org.springframework", "spring-web"),
    ("org.springframework.boot", "org.springframework.boot", "spring-boot-starter"),
    ("org.springframework.data.mongodb", "org.springframework.data", "spring-data-mongodb"),
    ("com.google.gson", "com.google.code.gson", "gson"),
    ("com.google.common", "com.google.guava", "guava"),
    ("com.fasterxml.jackson", "com.fasterxml.jackson.core", "jackson-databind"),
    ("org.slf4j", "org.slf4j", "slf4j-api"),
    ("ch.qos.logback", "ch.qos.logback", "logback-classic"),
    ("junit.framework", "junit", "junit"),
    ("org.junit", "org.junit.jupiter", "junit-jupiter-api"),
    ("org.apache.commons", "org.apache.commons", "commons-lang3"),
    ("org.apache.commons.lang3", "org.apache.commons", "commons-lang3"),
    ("javax.servlet", "javax.servlet", "javax.servlet-api"),
    ("jakarta.servlet", "jakarta.servlet", "jakarta.servlet-api"),
    ("com.zaxxer", "com.zaxxer", "HikariCP"),
    ("org.hibernate", "org.hibernate", "hibernate-core"),
    ("org.apache.logging.log4j", "org.apache.logging.log4j", "log4j-api"),
    ("io.reactivex", "io.reactivex", "rxjava"),
    ("org.joda.time", "joda-time", "joda-time"),
    ("org.mockito", "org.mockito", "mockito-core"),
    ("lombok", "org.projectlombok", "lombok"),
];

static GRADLE_DEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(\w+)\s*\(?\s*['"]([^:'"\s]+):([^:'"\s]+)(?::([^'"@\s]+))?(?:@\w+)?['"]\s*\)?"#,
    )
    .expect("gradle dependency regex")
});
static GRADLE_MAP_DEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(\w+)\s*\(?\s*group\s*[:=]\s*['"]([^'"]+)['"]\s*,\s*name\s*[:=]\s*['"]([^'"]+)['"](?:\s*,\s*version\s*[:=]\s*['"]([^'"]+)['"])?"#,
    )
    .expect("gradle map dependency regex")
});
static SETTINGS_INCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*include\s*\(?(.+?)\)?\s*$").expect("settings include regex"));
static JAVA_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*import\s+(static\s+)?([A-Za-z_][\w.]*?)(\.\*)?\s*;?\s*$").expect("java import regex")
});
static JAVA_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*package\s+([\w.]+)\s*;?").expect("java package regex"));

/// Maven and Gradle: declared coordinates plus JVM imports.
pub struct JavaHandler {
    policy: EcosystemPolicy,
}

impl JavaHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for JavaHandler {
    fn name(&self) -> &'static str {
        "Java"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Java
    }

    fn detect(&self, project: &Path) -> bool {
        ["pom.xml"]
            .iter()
            .chain(GRADLE_FILES)
            .chain(SETTINGS_FILES)
            .any(|f| project.join(f).exists())
            || fsutil::has_source_file(project, &["java"])
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let mut declared = Vec::new();

        let pom = project.join("pom.xml");
        if pom.exists() {
            let parsed = parse_pom(&read_manifest(&pom)?).map_err(|e| ScanError::manifest(&pom, e))?;
            declared.extend(parsed.dependencies);
        }

        for gradle in gradle_files(project) {
            match std::fs::read_to_string(&gradle) {
                Ok(content) => declared.extend(parse_gradle(&content)),
                // One unreadable module must not hide the others.
                Err(e) => warn!(path = %gradle.display(), error = %e, "skipping unreadable Gradle file"),
            }
        }

        let mut locked = Vec::new();
        for lock in fsutil::find_named(project, &["gradle.lockfile"]) {
            if let Ok(content) = std::fs::read_to_string(&lock) {
                locked.extend(parse_gradle_lockfile(&content));
            }
        }

        let evidence = Evidence {
            declared,
            scanned: scan_sources(project),
            locked,
        };
        reconcile(Ecosystem::Java, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let gradle = gradle_files(project);

        match gradle.as_slice() {
            [single] => {
                let existing = std::fs::read_to_string(single).unwrap_or_default();
                let kotlin = single.extension().is_some_and(|e| e == "kts");
                let contents = render_gradle(&existing, deps, kotlin, &self.policy);
                fsutil::replace_manifest(single, &contents, backup_dir)?;
                Ok(single.clone())
            }
            [] => {
                let pom = project.join("pom.xml");
                let existing = std::fs::read_to_string(&pom).ok();
                let coords = existing
                    .as_deref()
                    .and_then(|c| parse_pom(c).ok())
                    .map(|p| p.coordinates)
                    .unwrap_or_default();
                let contents = render_pom(&coords, deps, &self.policy)
                    .map_err(|e| RecoveryError::serialize(&pom, e))?;
                fsutil::replace_manifest(&pom, &contents, backup_dir)?;
                Ok(pom)
            }
            many => {
                for file in many {
                    fsutil::backup_file(file, backup_dir)?;
                }
                let out = project.join(RECOVERED_GRADLE);
                let contents = render_gradle("", deps, false, &self.policy);
                fsutil::replace_manifest(&out, &contents, backup_dir)?;
                info!(
                    files = many.len(),
                    path = %out.display(),
                    "several Gradle build files; wrote an aggregated recovery file"
                );
                Ok(out)
            }
        }
    }
}

/// Every Gradle build file, including modules listed in `settings.gradle`.
fn gradle_files(project: &Path) -> Vec<PathBuf> {
    let mut files: BTreeSet<PathBuf> = fsutil::find_named(project, GRADLE_FILES)
        .into_iter()
        .collect();

    for settings in SETTINGS_FILES.iter().map(|f| project.join(f)) {
        let Ok(content) = std::fs::read_to_string(&settings) else {
            continue;
        };
        for module in parse_settings_includes(&content) {
            let dir = project.join(&module);
            if let Some(file) = GRADLE_FILES.iter().map(|f| dir.join(f)).find(|f| f.exists()) {
                files.insert(file);
            }
        }
    }
    files.into_iter().collect()
}

/// `include ':a', ':b:c'` → `["a", "b/c"]`.
fn parse_settings_includes(content: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for caps in SETTINGS_INCLUDE.captures_iter(content) {
        for part in caps[1].split(',') {
            let name = part.trim().trim_matches(['"', '\'']).trim();
            let name = name.trim_start_matches(':').replace(':', "/");
            if !name.is_empty() {
                modules.push(name);
            }
        }
    }
    modules
}

fn configuration_scope(configuration: &str) -> Option<Scope> {
    let lower = configuration.to_ascii_lowercase();
    let scope = match lower.as_str() {
        c if c.contains("test") => Scope::Test,
        "implementation" | "api" | "compile" | "compileonly" => Scope::Compile,
        "runtimeonly" | "runtime" => Scope::Runtime,
        "annotationprocessor" | "kapt" => Scope::Build,
        _ => return None,
    };
    Some(scope)
}

fn parse_gradle(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    for re in [&*GRADLE_DEP, &*GRADLE_MAP_DEP] {
        for caps in re.captures_iter(content) {
            let Some(scope) = configuration_scope(&caps[1]) else {
                continue;
            };
            let version = caps.get(4).map(|m| m.as_str());
            deps.push(Dependency::coordinate(Ecosystem::Java, &caps[2], &caps[3], version, scope));
        }
    }
    deps
}

/// `gradle.lockfile`: `group:artifact:version=configurations`.
fn parse_gradle_lockfile(content: &str) -> Vec<Dependency> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let coord = line.split('=').next()?;
            let mut parts = coord.split(':');
            let (group, artifact, version) = (parts.next()?, parts.next()?, parts.next()?);
            Some(Dependency::coordinate(
                Ecosystem::Java,
                group,
                artifact,
                Some(version),
                Scope::Compile,
            ))
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PomCoordinates {
    group_id: Option<String>,
    artifact_id: Option<String>,
    version: Option<String>,
    packaging: Option<String>,
}

#[derive(Debug, Default)]
struct Pom {
    coordinates: PomCoordinates,
    dependencies: Vec<Dependency>,
}

/// Parse the project's own coordinates and its direct `<dependencies>`.
/// Dependency management and plugin dependencies are not project
/// dependencies and are ignored.
fn parse_pom(content: &str) -> Result<Pom, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut pom = Pom::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    let mut parent_group: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "dependency" && is_path(&stack, &["project", "dependencies"]) {
                    current.clear();
                }
                stack.push(name);
            }
            Event::End(_) => {
                if is_path(&stack, &["project", "dependencies", "dependency"]) {
                    let field = |k: &str| current.get(k).map(String::as_str);
                    if let Some(artifact) = field("artifactId") {
                        pom.dependencies.push(Dependency::coordinate(
                            Ecosystem::Java,
                            field("groupId").unwrap_or_default(),
                            artifact,
                            field("version"),
                            Scope::parse(field("scope").unwrap_or_default()),
                        ));
                    }
                }
                stack.pop();
            }
            Event::Text(e) => {
                let text = e.unescape()?.into_owned();
                let Some((leaf, parents)) = stack.split_last() else {
                    continue;
                };
                if is_path(parents, &["project", "dependencies", "dependency"]) {
                    current.insert(leaf.clone(), text);
                } else if is_path(parents, &["project", "parent"]) && leaf == "groupId" {
                    parent_group = Some(text);
                } else if is_path(parents, &["project"]) {
                    let c = &mut pom.coordinates;
                    match leaf.as_str() {
                        "groupId" => c.group_id = Some(text),
                        "artifactId" => c.artifact_id = Some(text),
                        "version" => c.version = Some(text),
                        "packaging" => c.packaging = Some(text),
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if pom.coordinates.group_id.is_none() {
        pom.coordinates.group_id = parent_group;
    }
    Ok(pom)
}

fn is_path(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

/// Map an import to Maven coordinates: built-in table first, then the
/// `first.second:third` heuristic.
fn import_coordinate(import: &str) -> Option<(String, String)> {
    let best = IMPORT_COORDINATES
        .iter()
        .filter(|(prefix, _, _)| import == *prefix || import.starts_with(&format!("{}.", prefix)))
        .max_by_key(|(prefix, _, _)| prefix.len());
    if let Some((_, group, artifact)) = best {
        return Some((group.to_string(), artifact.to_string()));
    }

    let parts: Vec<&str> = import.split('.').collect();
    match parts.as_slice() {
        [a, b, c, ..] => Some((format!("{}.{}", a, b), c.to_string())),
        [a, b] => Some((a.to_string(), b.to_string())),
        _ => None,
    }
}

fn is_jdk(import: &str) -> bool {
    let jdk = import.starts_with("java.")
        || import.starts_with("javax.")
        || import.starts_with("jdk.")
        || import.starts_with("sun.")
        || import.starts_with("com.sun.");
    // Some javax packages ship outside the JDK and are mapped explicitly.
    jdk && !IMPORT_COORDINATES
        .iter()
        .any(|(prefix, _, _)| import.starts_with(&format!("{}.", prefix)))
}

/// First three segments of a package, used to recognize project-local imports.
fn package_root(package: &str) -> String {
    package.split('.').take(3).collect::<Vec<_>>().join(".")
}

fn scan_sources(project: &Path) -> Vec<Dependency> {
    let files = fsutil::source_files(project, &["java", "kt"]);
    let sources: Vec<(PathBuf, String)> = files
        .into_iter()
        .filter_map(|f| std::fs::read_to_string(&f).ok().map(|s| (f, s)))
        .collect();

    let local: BTreeSet<String> = sources
        .iter()
        .filter_map(|(_, s)| JAVA_PACKAGE.captures(s).map(|c| package_root(&c[1])))
        .collect();

    let mut found: BTreeMap<(String, String), Scope> = BTreeMap::new();
    for (file, source) in &sources {
        let rel = file.strip_prefix(project).unwrap_or(file);
        let scope = if rel.components().any(|c| c.as_os_str() == "test") {
            Scope::Test
        } else {
            Scope::Compile
        };
        for caps in JAVA_IMPORT.captures_iter(source) {
            let mut import = caps[2].to_string();
            // `import static a.b.C.member;` names a member, not a type.
            if caps.get(1).is_some() && caps.get(3).is_none() {
                if let Some((owner, _)) = import.rsplit_once('.') {
                    import = owner.to_string();
                }
            }
            if is_jdk(&import) || local.iter().any(|l| import.starts_with(l.as_str())) {
                continue;
            }
            let Some(coordinate) = import_coordinate(&import) else {
                continue;
            };
            let entry = found.entry(coordinate).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(coordinates = found.len(), "mapped imports to coordinates");
    found
        .into_iter()
        .map(|((group, artifact), scope)| {
            Dependency::coordinate(Ecosystem::Java, &group, &artifact, None, scope)
        })
        .collect()
}

/// Records a coordinate grammar can express: both group and artifact.
fn writable(deps: &[Dependency]) -> impl Iterator<Item = &Dependency> {
    deps.iter().filter(|d| {
        let ok = !d.group_id.trim().is_empty() && !d.artifact_id.trim().is_empty();
        if !ok {
            debug!(key = %d.key, "skipping record without group or artifact");
        }
        ok
    })
}

fn gradle_configuration(scope: &Scope) -> &'static str {
    match scope {
        Scope::Compile => "implementation",
        Scope::Test => "testImplementation",
        Scope::Runtime => "runtimeOnly",
        Scope::Build => "annotationProcessor",
        Scope::Other(s) if s == "provided" => "compileOnly",
        Scope::Other(_) => "implementation",
    }
}

fn render_gradle_block(deps: &[Dependency], kotlin: bool, policy: &EcosystemPolicy) -> String {
    let mut by_config: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let order = [
        "implementation",
        "compileOnly",
        "runtimeOnly",
        "annotationProcessor",
        "testImplementation",
    ];

    for dep in writable(deps) {
        let config = gradle_configuration(&dep.scope);
        let slot = order.iter().position(|c| *c == config).unwrap_or(0);
        let (notation, note) = match (dep.version.as_deref(), policy.unresolved.placeholder()) {
            (Some(v), _) => (format!("{}:{}:{}", dep.group_id, dep.artifact_id, v), ""),
            (None, Some(p)) if !p.is_empty() => {
                (format!("{}:{}:{}", dep.group_id, dep.artifact_id, p), "")
            }
            (None, _) => (
                format!("{}:{}", dep.group_id, dep.artifact_id),
                " // version unresolved",
            ),
        };
        let quote = if kotlin || notation.contains('$') { '"' } else { '\'' };
        let line = if kotlin {
            format!("    {}({}{}{}){}", config, quote, notation, quote, note)
        } else {
            format!("    {} {}{}{}{}", config, quote, notation, quote, note)
        };
        by_config.entry(slot).or_default().push(line);
    }

    let mut out = String::from("dependencies {\n");
    for lines in by_config.values() {
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('}');
    out
}

/// Replace the top-level `dependencies { }` block of `existing`, keeping the
/// rest of the build script. Without one, a minimal script is produced.
fn render_gradle(existing: &str, deps: &[Dependency], kotlin: bool, policy: &EcosystemPolicy) -> String {
    let block = render_gradle_block(deps, kotlin, policy);

    if let Some((start, end)) = top_level_block(existing, "dependencies") {
        return format!("{}{}{}", &existing[..start], block, &existing[end..]);
    }
    if !existing.trim().is_empty() {
        return format!("{}\n\n{}\n", existing.trim_end(), block);
    }

    let plugins = if kotlin {
        "plugins {\n    id(\"java\")\n}\n"
    } else {
        "plugins {\n    id 'java'\n}\n"
    };
    format!("{}\nrepositories {{\n    mavenCentral()\n}}\n\n{}\n", plugins, block)
}

/// Byte span of an unindented `name {` block up to its matching brace.
fn top_level_block(content: &str, name: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let start = content.split_inclusive('\n').find_map(|line| {
        let at = offset;
        offset += line.len();
        let rest = line.strip_prefix(name)?;
        rest.trim_start().starts_with('{').then_some(at)
    })?;

    let mut depth = 0usize;
    for (i, c) in content[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some((start, start + i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn text_element(w: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> Result<(), quick_xml::Error> {
    w.write_event(Event::Start(BytesStart::new(tag)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// A minimal POM carrying the project's coordinates and `deps`.
fn render_pom(
    coords: &PomCoordinates,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, quick_xml::Error> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.write_event(Event::Start(BytesStart::new("project").with_attributes([
        ("xmlns", "http://maven.apache.org/POM/4.0.0"),
        ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
        (
            "xsi:schemaLocation",
            "http://maven.apache.org/POM/4.0.0 http://maven.apache.org/xsd/maven-4.0.0.xsd",
        ),
    ])))?;
    text_element(&mut w, "modelVersion", "4.0.0")?;
    text_element(&mut w, "groupId", coords.group_id.as_deref().unwrap_or("recovered"))?;
    text_element(&mut w, "artifactId", coords.artifact_id.as_deref().unwrap_or("recovered-project"))?;
    text_element(&mut w, "version", coords.version.as_deref().unwrap_or("1.0.0"))?;
    if let Some(packaging) = &coords.packaging {
        text_element(&mut w, "packaging", packaging)?;
    }

    w.write_event(Event::Start(BytesStart::new("dependencies")))?;
    for dep in writable(deps) {
        w.write_event(Event::Start(BytesStart::new("dependency")))?;
        text_element(&mut w, "groupId", &dep.group_id)?;
        text_element(&mut w, "artifactId", &dep.artifact_id)?;
        match (dep.version.as_deref(), policy.unresolved.placeholder()) {
            (Some(v), _) => text_element(&mut w, "version", v)?,
            (None, Some(p)) if !p.is_empty() => text_element(&mut w, "version", p)?,
            (None, _) => w.write_event(Event::Comment(BytesText::new(" version unresolved ")))?,
        }
        if dep.scope != Scope::Compile {
            text_element(&mut w, "scope", &dep.scope.to_string())?;
        }
        w.write_event(Event::End(BytesEnd::new("dependency")))?;
    }
    w.write_event(Event::End(BytesEnd::new("dependencies")))?;
    w.write_event(Event::End(BytesEnd::new("project")))?;

    let mut out = String::from_utf8_lossy(&w.into_inner()).into_owned();
    out.push('\n');
    Ok(out)
}
