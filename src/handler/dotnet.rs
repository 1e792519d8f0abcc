use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use tracing::debug;

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

const PROJECT_EXTENSIONS: &[&str] = &["csproj", "fsproj", "vbproj"];
const PACKAGES_CONFIG: &str = "packages.config";
const CENTRAL_VERSIONS: &str = "Directory.Packages.props";
const RECOVERED_PROJECT: &str = "Recovered.csproj";

/// Namespace roots shipped with the runtime.
const FRAMEWORK_ROOTS: &[&str] = &["System", "Microsoft", "Windows", "FSharp"];

/// Namespace prefix → NuGet id where the id is not the namespace itself.
const NAMESPACE_PACKAGES: &[(&str, &str)] = &[
    ("Newtonsoft.Json", "Newtonsoft.Json"),
    ("Serilog", "Serilog"),
    ("Dapper", "Dapper"),
    ("AutoMapper", "AutoMapper"),
    ("FluentValidation", "FluentValidation"),
    ("FluentAssertions", "FluentAssertions"),
    ("MediatR", "MediatR"),
    ("Moq", "Moq"),
    ("NUnit.Framework", "NUnit"),
    ("Xunit", "xunit"),
    ("Polly", "Polly"),
    ("StackExchange.Redis", "StackExchange.Redis"),
    ("Npgsql", "Npgsql"),
    ("NLog", "NLog"),
];

static USING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:global\s+)?(?:using|Imports|open)\s+(?:static\s+)?(?:\w+\s*=\s*)?([A-Za-z_][\w.]*)\s*;?\s*$")
        .expect("using regex")
});
static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*namespace\s+([A-Za-z_][\w.]*)").expect("namespace regex"));
static PAKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{4}(\S+)\s+\(([^)]+)\)").expect("paket.lock regex"));

/// NuGet: SDK-style project files, `packages.config`, central package
/// versions, `paket.lock`, and `using` directives.
pub struct DotNetHandler {
    policy: EcosystemPolicy,
}

impl DotNetHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for DotNetHandler {
    fn name(&self) -> &'static str {
        ".NET"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::DotNet
    }

    fn detect(&self, project: &Path) -> bool {
        !project_files(project).is_empty()
            || project.join(PACKAGES_CONFIG).exists()
            || project.join(CENTRAL_VERSIONS).exists()
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let mut declared = Vec::new();
        for file in project_files(project) {
            let rel = file.strip_prefix(project).unwrap_or(&file);
            let scope = if is_test_path(rel) { Scope::Test } else { Scope::Compile };
            let content = read_manifest(&file)?;
            declared.extend(
                parse_project_file(&content, scope).map_err(|e| ScanError::manifest(&file, e))?,
            );
        }

        let config = project.join(PACKAGES_CONFIG);
        if config.exists() {
            declared.extend(
                parse_packages_config(&read_manifest(&config)?)
                    .map_err(|e| ScanError::manifest(&config, e))?,
            );
        }

        let mut locked = Vec::new();
        let central = project.join(CENTRAL_VERSIONS);
        if central.exists() {
            locked.extend(
                parse_central_versions(&read_manifest(&central)?)
                    .map_err(|e| ScanError::manifest(&central, e))?,
            );
        }
        if let Ok(content) = std::fs::read_to_string(project.join("paket.lock")) {
            locked.extend(parse_paket_lock(&content));
        }

        let known: BTreeSet<String> = declared
            .iter()
            .chain(&locked)
            .map(|d| d.manifest_name().to_string())
            .collect();

        let evidence = Evidence {
            scanned: scan_sources(project, &known),
            declared,
            locked,
        };
        reconcile(Ecosystem::DotNet, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let config = project.join(PACKAGES_CONFIG);
        let (path, contents) = match project_files(project).into_iter().next() {
            Some(file) => {
                let existing = std::fs::read_to_string(&file).unwrap_or_default();
                let contents = rewrite_project_file(&existing, deps, &self.policy)
                    .map_err(|e| RecoveryError::serialize(&file, e))?;
                (file, contents)
            }
            None if config.exists() => {
                let contents = render_packages_config(deps, &self.policy)
                    .map_err(|e| RecoveryError::serialize(&config, e))?;
                (config, contents)
            }
            None => {
                let file = project.join(RECOVERED_PROJECT);
                let contents = rewrite_project_file(NEW_PROJECT, deps, &self.policy)
                    .map_err(|e| RecoveryError::serialize(&file, e))?;
                (file, contents)
            }
        };
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

const NEW_PROJECT: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <TargetFramework>net8.0</TargetFramework>
  </PropertyGroup>
</Project>
"#;

/// Project files directly under `project`, sorted.
fn project_files(project: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(project) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| PROJECT_EXTENSIONS.contains(&e))
        })
        .collect();
    files.sort();
    files
}

fn is_test_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy().contains("Test"))
}

fn nuget(id: &str, version: Option<&str>, scope: Scope) -> Dependency {
    Dependency::package(Ecosystem::DotNet, id, version, scope)
}

fn local_name(name: quick_xml::name::LocalName<'_>) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> BTreeMap<String, String> {
    e.attributes()
        .flatten()
        .map(|a| {
            let key = local_name(a.key.local_name());
            let value = a.unescape_value().unwrap_or_default().into_owned();
            (key, value)
        })
        .collect()
}

/// `<PackageReference Include=".." Version=".." />`, with the version also
/// accepted as a child element or a `VersionOverride`.
fn parse_project_file(content: &str, scope: Scope) -> Result<Vec<Dependency>, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut deps = Vec::new();
    // Open `<PackageReference>` and whether its `<Version>` child is open.
    let mut open: Option<(String, Option<String>)> = None;
    let mut in_version = false;

    loop {
        match reader.read_event()? {
            Event::Empty(e) if local_name(e.local_name()) == "PackageReference" => {
                let attrs = attributes(&e);
                if let Some(id) = attrs.get("Include").or_else(|| attrs.get("Update")) {
                    let version = attrs.get("VersionOverride").or_else(|| attrs.get("Version"));
                    deps.push(nuget(id, version.map(String::as_str), scope.clone()));
                }
            }
            Event::Start(e) => match local_name(e.local_name()).as_str() {
                "PackageReference" => {
                    let attrs = attributes(&e);
                    open = attrs
                        .get("Include")
                        .map(|id| (id.clone(), attrs.get("Version").cloned()));
                }
                "Version" if open.is_some() => in_version = true,
                _ => {}
            },
            Event::Text(t) if in_version => {
                if let Some((_, version)) = open.as_mut() {
                    *version = Some(t.unescape()?.into_owned());
                }
            }
            Event::End(e) => match local_name(e.local_name()).as_str() {
                "Version" => in_version = false,
                "PackageReference" => {
                    if let Some((id, version)) = open.take() {
                        deps.push(nuget(&id, version.as_deref(), scope.clone()));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(deps)
}

/// `<package id=".." version=".." />`; development dependencies are build-only.
fn parse_packages_config(content: &str) -> Result<Vec<Dependency>, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut deps = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if local_name(e.local_name()) == "package" => {
                let attrs = attributes(&e);
                if let Some(id) = attrs.get("id") {
                    let scope = match attrs.get("developmentDependency").map(String::as_str) {
                        Some("true") => Scope::Build,
                        _ => Scope::Compile,
                    };
                    deps.push(nuget(id, attrs.get("version").map(String::as_str), scope));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(deps)
}

/// `<PackageVersion Include=".." Version=".." />` from central package management.
fn parse_central_versions(content: &str) -> Result<Vec<Dependency>, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut deps = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if local_name(e.local_name()) == "PackageVersion" => {
                let attrs = attributes(&e);
                if let Some(id) = attrs.get("Include") {
                    deps.push(nuget(id, attrs.get("Version").map(String::as_str), Scope::Compile));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(deps)
}

/// `paket.lock` NUGET section entries like `    Newtonsoft.Json (13.0.1)`.
fn parse_paket_lock(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut in_nuget = false;

    for line in content.lines() {
        if line.trim_end() == "NUGET" {
            in_nuget = true;
            continue;
        }
        // A new top-level section ends the NUGET block.
        if !line.starts_with(' ') && !line.is_empty() {
            in_nuget = false;
        }
        if in_nuget {
            if let Some(caps) = PAKET_RE.captures(line) {
                deps.push(nuget(&caps[1], Some(&caps[2]), Scope::Compile));
            }
        }
    }
    deps
}

fn is_framework(namespace: &str) -> bool {
    let root = namespace.split('.').next().unwrap_or_default();
    FRAMEWORK_ROOTS.contains(&root)
}

fn has_prefix(namespace: &str, prefix: &str) -> bool {
    namespace == prefix || namespace.starts_with(&format!("{}.", prefix))
}

/// Package id for a namespace: the longest known id that is a prefix of it,
/// then the built-in table, then the first two segments.
fn package_for_namespace(namespace: &str, known: &BTreeSet<String>) -> String {
    if let Some(id) = known
        .iter()
        .filter(|id| has_prefix(namespace, id))
        .max_by_key(|id| id.len())
    {
        return id.clone();
    }
    if let Some((_, id)) = NAMESPACE_PACKAGES
        .iter()
        .filter(|(ns, _)| has_prefix(namespace, ns))
        .max_by_key(|(ns, _)| ns.len())
    {
        return id.to_string();
    }
    namespace.split('.').take(2).collect::<Vec<_>>().join(".")
}

fn scan_sources(project: &Path, known: &BTreeSet<String>) -> Vec<Dependency> {
    let sources: Vec<(PathBuf, String)> = fsutil::source_files(project, &["cs", "vb", "fs"])
        .into_iter()
        .filter_map(|f| std::fs::read_to_string(&f).ok().map(|s| (f, s)))
        .collect();

    let local: BTreeSet<String> = sources
        .iter()
        .flat_map(|(_, s)| NAMESPACE_RE.captures_iter(s).map(|c| c[1].to_string()))
        .map(|ns| ns.split('.').take(2).collect::<Vec<_>>().join("."))
        .collect();

    let mut found: BTreeMap<String, Scope> = BTreeMap::new();
    for (file, source) in &sources {
        let rel = file.strip_prefix(project).unwrap_or(file);
        let scope = if is_test_path(rel) { Scope::Test } else { Scope::Compile };
        for caps in USING_RE.captures_iter(source) {
            let namespace = &caps[1];
            if is_framework(namespace) || local.iter().any(|l| has_prefix(namespace, l)) {
                continue;
            }
            let id = package_for_namespace(namespace, known);
            let entry = found.entry(id).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(packages = found.len(), "mapped using directives to packages");
    found
        .into_iter()
        .map(|(id, scope)| nuget(&id, None, scope))
        .collect()
}

fn rendered_version<'a>(dep: &'a Dependency, policy: &EcosystemPolicy) -> Option<&'a str> {
    dep.version
        .as_deref()
        .or_else(|| policy.unresolved.placeholder().filter(|p| !p.is_empty()))
}

fn write_package_group(
    w: &mut Writer<Vec<u8>>,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<(), quick_xml::Error> {
    w.write_event(Event::Start(BytesStart::new("ItemGroup")))?;
    for dep in deps.iter().filter(|d| !d.manifest_name().is_empty()) {
        let mut el = BytesStart::new("PackageReference");
        el.push_attribute(("Include", dep.manifest_name()));
        if let Some(version) = rendered_version(dep, policy) {
            el.push_attribute(("Version", version));
        }
        if dep.scope == Scope::Build {
            el.push_attribute(("PrivateAssets", "all"));
        }
        w.write_event(Event::Empty(el))?;
    }
    w.write_event(Event::End(BytesEnd::new("ItemGroup")))?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Start,
    Empty,
    End,
    Other,
}

/// Drop every `PackageReference` and write one `ItemGroup` with `deps`
/// where the first one stood (or at the end of the project). Item groups
/// left empty are removed; everything else is kept.
fn rewrite_project_file(
    existing: &str,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(existing);
    reader.config_mut().trim_text(true);
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut group: Option<Vec<Event<'static>>> = None;
    let mut group_had_refs = false;
    let mut skip_depth = 0usize;
    let mut inserted = false;

    loop {
        let event = reader.read_event()?;
        let (kind, name) = match &event {
            Event::Start(e) => (Kind::Start, local_name(e.local_name())),
            Event::Empty(e) => (Kind::Empty, local_name(e.local_name())),
            Event::End(e) => (Kind::End, local_name(e.local_name())),
            Event::Eof => break,
            _ => (Kind::Other, String::new()),
        };

        if skip_depth > 0 {
            match kind {
                Kind::Start => skip_depth += 1,
                Kind::End => skip_depth -= 1,
                _ => {}
            }
            continue;
        }

        match (kind, name.as_str()) {
            (Kind::Start, "PackageReference") => {
                skip_depth = 1;
                group_had_refs = true;
                continue;
            }
            (Kind::Empty, "PackageReference") => {
                group_had_refs = true;
                continue;
            }
            (Kind::Start, "ItemGroup") if group.is_none() => {
                group = Some(vec![event.into_owned()]);
                group_had_refs = false;
                continue;
            }
            (Kind::End, "ItemGroup") => {
                if let Some(buffered) = group.take() {
                    if buffered.len() > 1 {
                        for e in buffered {
                            w.write_event(e)?;
                        }
                        w.write_event(event)?;
                    }
                    if group_had_refs && !inserted {
                        write_package_group(&mut w, deps, policy)?;
                        inserted = true;
                    }
                    continue;
                }
            }
            (Kind::End, "Project") if !inserted => {
                write_package_group(&mut w, deps, policy)?;
                inserted = true;
            }
            _ => {}
        }

        match group.as_mut() {
            Some(buffered) => buffered.push(event.into_owned()),
            None => w.write_event(event)?,
        }
    }

    let mut out = String::from_utf8_lossy(&w.into_inner()).into_owned();
    out.push('\n');
    Ok(out)
}

fn render_packages_config(deps: &[Dependency], policy: &EcosystemPolicy) -> Result<String, quick_xml::Error> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    w.write_event(Event::Start(BytesStart::new("packages")))?;
    for dep in deps.iter().filter(|d| !d.manifest_name().is_empty()) {
        let mut el = BytesStart::new("package");
        el.push_attribute(("id", dep.manifest_name()));
        // `version` is mandatory in this format.
        el.push_attribute(("version", rendered_version(dep, policy).unwrap_or("")));
        if dep.scope == Scope::Build {
            el.push_attribute(("developmentDependency", "true"));
        }
        w.write_event(Event::Empty(el))?;
    }
    w.write_event(Event::End(BytesEnd::new("packages")))?;

    let mut out = String::from_utf8_lossy(&w.into_inner()).into_owned();
    out.push('\n');
    Ok(out)
}
