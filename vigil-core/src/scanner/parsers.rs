//! Parser functions keyed by descriptor id. Each maps raw scanner output to
//! normalized artifacts and findings; unparseable records are skipped and
//! surfaced as warnings rather than failing the scan.

use quick_xml::de::from_str;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::model::{
    AssetArtifact, AssetKind, EdgeArtifact, FindingArtifact, Proto, RelType, ScanOutput,
    ServiceArtifact, Severity,
};
use crate::normalize::{self, classify_host};
use crate::scope::ScopePolicy;

use super::descriptor::ParserId;

pub struct ParseContext<'a> {
    pub scope: &'a ScopePolicy,
    pub target: &'a str,
}

pub fn parse(parser: ParserId, lines: &[String], ctx: &ParseContext<'_>) -> ScanOutput {
    match parser {
        ParserId::SubfinderLines => parse_subfinder(lines),
        ParserId::NmapXml => parse_nmap(&lines.join("\n"), ctx),
        ParserId::HttpxJsonl => parse_httpx(lines),
        ParserId::NucleiJsonl => parse_nuclei(lines, ctx),
    }
}

/// Fallback impact statement keyed by severity, used when the scanner's own
/// output carries none. Every persisted finding documents why it matters.
fn severity_impact(severity: Severity, name: &str) -> String {
    match severity {
        Severity::Critical => format!(
            "This is a critical-severity finding that could lead to full system compromise. \
             '{name}' may allow remote code execution, authentication bypass, or direct access \
             to sensitive data. Immediate remediation is strongly recommended."
        ),
        Severity::High => format!(
            "This high-severity finding represents a significant security risk. '{name}' could \
             be exploited to gain unauthorized access, steal sensitive data, or disrupt \
             services. Remediation should be prioritized."
        ),
        Severity::Medium => format!(
            "This medium-severity finding indicates a security weakness that could be exploited \
             in combination with other vulnerabilities. '{name}' may assist attackers in \
             reconnaissance or provide a stepping stone for more serious attacks."
        ),
        Severity::Low => format!(
            "This low-severity finding represents a minor security concern. While '{name}' \
             alone may not be directly exploitable, it provides information that helps \
             attackers map the attack surface."
        ),
        Severity::Info => format!(
            "This informational finding documents a detected technology, configuration, or \
             service. While not a vulnerability itself, '{name}' gives attackers useful \
             reconnaissance data about the infrastructure."
        ),
    }
}

fn parse_subfinder(lines: &[String]) -> ScanOutput {
    let mut output = ScanOutput::default();
    for line in lines {
        let candidate = line.trim();
        if candidate.is_empty() {
            continue;
        }
        let normalized = match normalize::normalize_host(candidate) {
            Ok(normalized) => normalized,
            Err(err) => {
                output.warnings.push(format!("skipped {candidate:?}: {err}"));
                continue;
            }
        };
        output.assets.push(AssetArtifact {
            kind: AssetKind::Subdomain,
            value: candidate.to_string(),
            normalized: normalized.clone(),
        });
        output.findings.push(FindingArtifact {
            severity: Some(Severity::Info),
            title: format!("Subdomain discovered: {normalized}"),
            description: format!("Subdomain {normalized} was found via passive enumeration"),
            impact: severity_impact(Severity::Info, &normalized),
            url: normalized,
            ..Default::default()
        });
    }
    output
}

// Nmap's XML shape, deserialized the narrow way: only the attributes the
// inventory cares about.
#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Deserialize)]
struct NmapHost {
    address: Option<NmapAddress>,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
}

#[derive(Debug, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u32,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
    #[serde(rename = "script", default)]
    scripts: Vec<NmapScript>,
}

#[derive(Debug, Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapService {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@product")]
    product: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapScript {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@output")]
    output: Option<String>,
}

fn parse_nmap(xml: &str, ctx: &ParseContext<'_>) -> ScanOutput {
    let mut output = ScanOutput::default();
    let run: NmapRun = match from_str(xml) {
        Ok(run) => run,
        Err(err) => {
            output.warnings.push(format!("nmap xml parse failed: {err}"));
            return output;
        }
    };

    for host in run.hosts {
        let addr = host
            .address
            .as_ref()
            .map(|a| a.addr.clone())
            .unwrap_or_else(|| ctx.target.to_string());
        let Ok(host_norm) = normalize_host_or_ip(&addr, ctx.scope) else {
            output.warnings.push(format!("skipped nmap host {addr:?}"));
            continue;
        };
        let host_kind = classify_host(&host_norm);
        let host_artifact = AssetArtifact {
            kind: host_kind,
            value: addr.clone(),
            normalized: host_norm.clone(),
        };
        output.assets.push(host_artifact.clone());

        let Some(ports) = host.ports else { continue };
        for port in ports.ports {
            if port.state.state != "open" {
                continue;
            }
            let Ok(proto) = Proto::parse(&port.protocol) else {
                continue;
            };
            let Ok(port_num) = u16::try_from(port.portid) else {
                continue;
            };
            if port_num == 0 {
                continue;
            }

            let (name, product, version) = match &port.service {
                Some(service) => (
                    service.name.clone(),
                    none_if_empty(service.product.clone()),
                    none_if_empty(service.version.clone()),
                ),
                None => (None, None, None),
            };

            output.services.push(ServiceArtifact {
                host: host_artifact.clone(),
                port: port_num,
                proto,
                name: name.clone(),
                product: product.clone(),
                version: version.clone(),
            });

            let mut desc = name.clone().unwrap_or_else(|| "unknown".to_string());
            if let Some(product) = &product {
                desc.push_str(&format!(" ({product}"));
                if let Some(version) = &version {
                    desc.push_str(&format!(" {version}"));
                }
                desc.push(')');
            }
            let title = format!("Open port {port_num}/{} - {desc}", proto.as_str());
            output.findings.push(FindingArtifact {
                severity: Some(Severity::Info),
                description: format!(
                    "Port {port_num}/{} is open on {host_norm} running {desc}",
                    proto.as_str()
                ),
                impact: severity_impact(Severity::Info, &title),
                title,
                url: format!("{host_norm}:{port_num}"),
                ..Default::default()
            });

            for script in &port.scripts {
                let id = script.id.as_deref().unwrap_or_default();
                let lowered = id.to_ascii_lowercase();
                if ["vuln", "exploit", "cve"].iter().any(|kw| lowered.contains(kw)) {
                    let script_output = script.output.clone().unwrap_or_default();
                    output.findings.push(FindingArtifact {
                        severity: Some(Severity::High),
                        title: format!("Nmap script: {id} on port {port_num}"),
                        description: truncate(&script_output, 500),
                        impact: severity_impact(Severity::High, id),
                        evidence: script_output,
                        url: format!("{host_norm}:{port_num}"),
                        ..Default::default()
                    });
                }
            }
        }
    }
    output
}

fn parse_httpx(lines: &[String]) -> ScanOutput {
    let mut output = ScanOutput::default();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };

        let url_raw = data
            .get("url")
            .and_then(Value::as_str)
            .or_else(|| data.get("input").and_then(Value::as_str))
            .unwrap_or_default();
        let Ok(url_norm) = normalize::normalize_url(url_raw) else {
            continue;
        };

        let status = data.get("status_code").and_then(Value::as_i64).unwrap_or(0);
        let title = data.get("title").and_then(Value::as_str).unwrap_or_default();
        let web_server = data
            .get("webserver")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tech: Vec<String> = data
            .get("tech")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        output.assets.push(AssetArtifact {
            kind: AssetKind::Url,
            value: url_raw.to_string(),
            normalized: url_norm.clone(),
        });

        if let Some(host) = Url::parse(&url_norm).ok().and_then(|u| u.host_str().map(String::from))
        {
            let host_norm = if normalize::is_ip(&host) {
                Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
            } else {
                normalize::normalize_host(&host).ok()
            };
            if let Some(host_norm) = host_norm {
                // Probed names were fed in as subdomains; keep them under the
                // same inventory key so revisits update one row.
                let kind = if normalize::is_ip(&host_norm) {
                    AssetKind::Ip
                } else {
                    AssetKind::Subdomain
                };
                let host_artifact = AssetArtifact {
                    kind,
                    value: host.clone(),
                    normalized: host_norm,
                };
                output.assets.push(host_artifact.clone());
                output.edges.push(EdgeArtifact {
                    from: host_artifact,
                    to: AssetArtifact {
                        kind: AssetKind::Url,
                        value: url_raw.to_string(),
                        normalized: url_norm.clone(),
                    },
                    rel_type: RelType::Serves,
                });
            }
        }

        let tech_str = if tech.is_empty() {
            "none detected".to_string()
        } else {
            tech.join(", ")
        };
        output.findings.push(FindingArtifact {
            severity: Some(Severity::Info),
            title: format!("Live host: {url_norm} [{status}]"),
            description: format!(
                "Live host: {url_norm} [HTTP {status}] Title: {title} Server: {web_server} Technologies: {tech_str}"
            ),
            impact: format!(
                "This host is live and publicly accessible. Technologies detected: {tech_str}. \
                 Each technology expands the attack surface; attackers will look for known \
                 vulnerabilities in these specific versions."
            ),
            evidence: format!("Status: {status}, Title: {title}, Server: {web_server}, Tech: {tech_str}"),
            url: url_norm.clone(),
            ..Default::default()
        });

        let lowered = web_server.to_ascii_lowercase();
        if ["apache/2.2", "nginx/1.0", "iis/6", "iis/7"]
            .iter()
            .any(|v| lowered.contains(v))
        {
            output.findings.push(FindingArtifact {
                severity: Some(Severity::Medium),
                title: format!("Outdated web server: {web_server}"),
                description: format!(
                    "The web server at {url_norm} is running {web_server}, which is outdated and likely has known vulnerabilities."
                ),
                impact: format!(
                    "Outdated server software ({web_server}) has publicly known CVEs with \
                     available exploits. Attackers can use automated tools to identify and \
                     exploit these vulnerabilities for remote code execution or denial of \
                     service."
                ),
                remediation: "Upgrade to the latest stable version of the web server.".to_string(),
                url: url_norm.clone(),
                ..Default::default()
            });
        }
    }
    output
}

fn parse_nuclei(lines: &[String], ctx: &ParseContext<'_>) -> ScanOutput {
    let mut output = ScanOutput::default();
    let mut seen_urls = std::collections::HashSet::new();

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        // Stats lines carry no template id.
        let Some(template_id) = data.get("template-id").and_then(Value::as_str) else {
            continue;
        };

        let info = data.get("info").cloned().unwrap_or_default();
        let severity = info
            .get("severity")
            .and_then(Value::as_str)
            .map(Severity::parse_lenient)
            .unwrap_or(Severity::Info);
        let template_name = info
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(template_id)
            .to_string();
        let matched_at = data
            .get("matched-at")
            .and_then(Value::as_str)
            .or_else(|| data.get("host").and_then(Value::as_str))
            .unwrap_or(ctx.target)
            .to_string();

        let mut description_parts = Vec::new();
        if let Some(desc) = info.get("description").and_then(Value::as_str) {
            description_parts.push(desc.to_string());
        }
        if let Some(matcher) = data.get("matcher-name").and_then(Value::as_str) {
            description_parts.push(format!("Matcher: {matcher}"));
        }

        let mut evidence_parts = Vec::new();
        if let Some(curl) = data.get("curl-command").and_then(Value::as_str) {
            evidence_parts.push(format!("curl: {curl}"));
        }
        if let Some(extracted) = data.get("extracted-results") {
            if !extracted.is_null() {
                evidence_parts.push(format!("extracted: {extracted}"));
            }
        }

        let remediation = info
            .get("remediation")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                info.get("reference").and_then(Value::as_array).map(|refs| {
                    let rendered: Vec<String> = refs
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|r| format!("- {r}"))
                        .collect();
                    format!("References:\n{}", rendered.join("\n"))
                })
            })
            .unwrap_or_default();

        let classification = info.get("classification").cloned().unwrap_or_default();
        let cve = match classification.get("cve-id") {
            Some(Value::Array(ids)) => ids
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some(Value::String(id)) => id.clone(),
            _ => String::new(),
        };
        let cvss_score = classification
            .get("cvss-score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        // Templates rarely carry their own impact text; fall back to the
        // severity-keyed statement.
        let impact = info
            .get("impact")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| severity_impact(severity, &template_name));

        output.findings.push(FindingArtifact {
            severity: Some(severity),
            title: format!("[{template_id}] {template_name}"),
            description: if description_parts.is_empty() {
                template_name.clone()
            } else {
                description_parts.join("\n")
            },
            impact,
            evidence: evidence_parts.join("\n"),
            remediation,
            url: matched_at.clone(),
            cve,
            cvss_score,
            ..Default::default()
        });

        // Each matched location also counts as a URL asset when it normalizes.
        if let Ok(url_norm) = normalize::normalize_url(&matched_at) {
            if seen_urls.insert(url_norm.clone()) {
                output.assets.push(AssetArtifact {
                    kind: AssetKind::Url,
                    value: matched_at,
                    normalized: url_norm,
                });
            }
        }
    }
    output
}

fn normalize_host_or_ip(raw: &str, scope: &ScopePolicy) -> Result<String, ()> {
    if normalize::is_ip(raw) {
        normalize::normalize_ip(raw, scope).map_err(|_| ())
    } else {
        normalize::normalize_host(raw).map_err(|_| ())
    }
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        let mut end = max;
        while end > 0 && !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_scope() -> ScopePolicy {
        ScopePolicy::for_root("example.com")
    }

    fn lines(raw: &str) -> Vec<String> {
        raw.lines().map(str::to_string).collect()
    }

    #[test]
    fn subfinder_lines_become_subdomain_assets() {
        let out = parse_subfinder(&lines("A.example.com\n\nb.example.com\nnot a domain!\n"));
        let normalized: Vec<&str> = out.assets.iter().map(|a| a.normalized.as_str()).collect();
        assert_eq!(normalized, vec!["a.example.com", "b.example.com"]);
        assert_eq!(out.findings.len(), 2);
        assert!(out.findings.iter().all(|f| !f.impact.is_empty()));
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn nmap_xml_extracts_open_services() {
        let xml = r#"
            <nmaprun>
              <host>
                <address addr="1.2.3.4" addrtype="ipv4"/>
                <ports>
                  <port portid="80" protocol="tcp">
                    <state state="open"/>
                    <service name="http" product="nginx" version="1.25.3"/>
                  </port>
                  <port portid="443" protocol="tcp">
                    <state state="closed"/>
                  </port>
                </ports>
              </host>
            </nmaprun>
        "#;
        let scope = ctx_scope();
        let ctx = ParseContext {
            scope: &scope,
            target: "1.2.3.4",
        };
        let out = parse_nmap(xml, &ctx);
        assert_eq!(out.services.len(), 1);
        let svc = &out.services[0];
        assert_eq!(svc.port, 80);
        assert_eq!(svc.proto, Proto::Tcp);
        assert_eq!(svc.name.as_deref(), Some("http"));
        assert_eq!(svc.product.as_deref(), Some("nginx"));
        assert_eq!(svc.host.kind, AssetKind::Ip);
        assert!(out
            .findings
            .iter()
            .any(|f| f.title.contains("Open port 80/tcp")));
    }

    #[test]
    fn nmap_vuln_scripts_become_high_findings() {
        let xml = r#"
            <nmaprun>
              <host>
                <address addr="1.2.3.4"/>
                <ports>
                  <port portid="443" protocol="tcp">
                    <state state="open"/>
                    <service name="https"/>
                    <script id="ssl-heartbleed-vuln" output="VULNERABLE"/>
                  </port>
                </ports>
              </host>
            </nmaprun>
        "#;
        let scope = ctx_scope();
        let ctx = ParseContext {
            scope: &scope,
            target: "1.2.3.4",
        };
        let out = parse_nmap(xml, &ctx);
        assert!(out
            .findings
            .iter()
            .any(|f| f.severity() == Severity::High && f.title.contains("ssl-heartbleed-vuln")));
    }

    #[test]
    fn httpx_jsonl_produces_url_assets_and_serves_edges() {
        let raw = r#"{"url":"http://a.example.com:80/","status_code":200,"title":"Home","webserver":"nginx","tech":["Nginx"]}"#;
        let out = parse_httpx(&lines(raw));
        assert!(out
            .assets
            .iter()
            .any(|a| a.kind == AssetKind::Url && a.normalized == "http://a.example.com/"));
        assert!(out
            .assets
            .iter()
            .any(|a| a.kind == AssetKind::Subdomain && a.normalized == "a.example.com"));
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].rel_type, RelType::Serves);
    }

    #[test]
    fn httpx_flags_outdated_servers() {
        let raw = r#"{"url":"http://a.example.com/","status_code":200,"webserver":"Apache/2.2.3"}"#;
        let out = parse_httpx(&lines(raw));
        let outdated = out
            .findings
            .iter()
            .find(|f| f.severity() == Severity::Medium && f.title.contains("Outdated"))
            .expect("outdated server finding");
        assert!(outdated.impact.contains("Apache/2.2.3"));
    }

    #[test]
    fn nuclei_jsonl_maps_classification_and_skips_stats() {
        let raw = concat!(
            r#"{"percent":50,"requests":10}"#,
            "\n",
            r#"{"template-id":"cve-2021-44228","info":{"name":"Log4Shell","severity":"critical","classification":{"cve-id":["CVE-2021-44228"],"cvss-score":10.0}},"matched-at":"http://a.example.com/api"}"#
        );
        let scope = ctx_scope();
        let ctx = ParseContext {
            scope: &scope,
            target: "http://a.example.com",
        };
        let out = parse_nuclei(&lines(raw), &ctx);
        assert_eq!(out.findings.len(), 1);
        let finding = &out.findings[0];
        assert_eq!(finding.severity(), Severity::Critical);
        assert_eq!(finding.cve, "CVE-2021-44228");
        assert_eq!(finding.cvss_score, 10.0);
        // The template carried no impact of its own; the severity fallback
        // fills it in.
        assert!(finding.impact.contains("critical-severity"));
        assert!(finding.impact.contains("Log4Shell"));
        assert!(out
            .assets
            .iter()
            .any(|a| a.normalized == "http://a.example.com/api"));
    }
}
