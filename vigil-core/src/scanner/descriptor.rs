//! Scanner descriptors: the data that defines how each external tool is
//! invoked and parsed. Adding a scanner is adding a row here plus a parser
//! branch; there is no per-scanner class hierarchy.

use crate::orchestration::job::ScannerKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParserId {
    SubfinderLines,
    NmapXml,
    HttpxJsonl,
    NucleiJsonl,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactClass {
    Subdomains,
    Hosts,
    Services,
    Urls,
    Findings,
}

#[derive(Clone, Debug)]
pub struct ScannerDescriptor {
    pub kind: ScannerKind,
    pub binary: &'static str,
    /// Argv template; `{target}` is substituted with the normalized target.
    /// Batch scanners read their target list from stdin instead.
    pub argv: &'static [&'static str],
    pub timeout_secs: u64,
    /// Batch scanners accept a newline-separated target list on stdin.
    pub batch_stdin: bool,
    pub parser: ParserId,
    pub produces: &'static [ArtifactClass],
}

/// Registry of subprocess-backed scanners. `dns_resolve` is not listed: it is
/// executed in-process by the resolver, not as a tool container subprocess.
pub fn descriptor_for(kind: ScannerKind) -> Option<&'static ScannerDescriptor> {
    DESCRIPTORS.iter().find(|d| d.kind == kind)
}

static DESCRIPTORS: &[ScannerDescriptor] = &[
    ScannerDescriptor {
        kind: ScannerKind::Subfinder,
        binary: "subfinder",
        argv: &["subfinder", "-d", "{target}", "-silent"],
        timeout_secs: 120,
        batch_stdin: false,
        parser: ParserId::SubfinderLines,
        produces: &[ArtifactClass::Subdomains, ArtifactClass::Findings],
    },
    ScannerDescriptor {
        kind: ScannerKind::Nmap,
        binary: "nmap",
        argv: &["nmap", "-sV", "-sC", "-T4", "-oX", "-", "{target}"],
        timeout_secs: 600,
        batch_stdin: false,
        parser: ParserId::NmapXml,
        produces: &[
            ArtifactClass::Hosts,
            ArtifactClass::Services,
            ArtifactClass::Findings,
        ],
    },
    ScannerDescriptor {
        kind: ScannerKind::Httpx,
        binary: "httpx",
        argv: &[
            "httpx",
            "-json",
            "-silent",
            "-status-code",
            "-title",
            "-tech-detect",
            "-follow-redirects",
            "-content-length",
            "-web-server",
        ],
        timeout_secs: 120,
        batch_stdin: true,
        parser: ParserId::HttpxJsonl,
        produces: &[
            ArtifactClass::Urls,
            ArtifactClass::Hosts,
            ArtifactClass::Findings,
        ],
    },
    ScannerDescriptor {
        kind: ScannerKind::Nuclei,
        binary: "nuclei",
        argv: &["nuclei", "-jsonl", "-silent"],
        timeout_secs: 600,
        batch_stdin: true,
        parser: ParserId::NucleiJsonl,
        produces: &[ArtifactClass::Findings, ArtifactClass::Urls],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subprocess_scanner_has_a_descriptor() {
        for kind in [ScannerKind::Subfinder, ScannerKind::Nmap, ScannerKind::Httpx, ScannerKind::Nuclei] {
            let descriptor = descriptor_for(kind).expect("descriptor");
            assert_eq!(descriptor.kind, kind);
            assert!(!descriptor.argv.is_empty());
            assert!(descriptor.timeout_secs > 0);
        }
    }

    #[test]
    fn dns_resolve_is_builtin_not_subprocess() {
        assert!(descriptor_for(ScannerKind::DnsResolve).is_none());
    }

    #[test]
    fn batch_scanners_read_stdin() {
        assert!(descriptor_for(ScannerKind::Httpx).unwrap().batch_stdin);
        assert!(descriptor_for(ScannerKind::Nuclei).unwrap().batch_stdin);
        assert!(!descriptor_for(ScannerKind::Subfinder).unwrap().batch_stdin);
    }
}
