/*!
Parsing of the binary-sources configuration string.

The string is a `;`-separated list of provider segments. Each segment is
`kind[,arg…][,mode]` where the mode is `read`, `write`, or `readwrite`
(default `read`). Two special segments manipulate the list itself: `clear`
drops everything configured so far, and `default` re-adds the files provider
rooted in the user's cache directory.

```text
clear;files,/mnt/cache,readwrite;http,https://ci.example.com/{triplet}/{sha},read
```
*/

use snafu::{ensure, ResultExt, Snafu};
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("unknown binary provider kind '{kind}'"))]
    UnknownProvider { kind: String },

    #[snafu(display("binary provider '{kind}' requires {what}"))]
    MissingArgument { kind: &'static str, what: &'static str },

    #[snafu(display("binary provider '{kind}' does not accept '{argument}'"))]
    UnexpectedArgument { kind: &'static str, argument: String },

    #[snafu(display("binary provider '{kind}' requires an absolute path, got '{}'", path.display()))]
    RelativePath { kind: &'static str, path: PathBuf },

    #[snafu(display("invalid URL '{url}' for binary provider '{kind}': {source}"))]
    InvalidUrl {
        kind: &'static str,
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("binary provider '{kind}' requires an https:// URL, got '{url}'"))]
    NotHttps { kind: &'static str, url: String },

    #[snafu(display("URL template '{url}' must contain a {{sha}} substitution"))]
    TemplateWithoutSha { url: String },

    #[snafu(display("gcs prefix '{prefix}' must start with gs://"))]
    NotGsScheme { prefix: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Whether a provider is consulted for reads, writes, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheAccess {
    Read,
    Write,
    ReadWrite,
}

impl CacheAccess {
    pub(crate) fn read(self) -> bool {
        matches!(self, CacheAccess::Read | CacheAccess::ReadWrite)
    }

    pub(crate) fn write(self) -> bool {
        matches!(self, CacheAccess::Write | CacheAccess::ReadWrite)
    }
}

/// One parsed provider declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProviderConfig {
    Files {
        root: PathBuf,
    },
    Http {
        template: String,
        authorization: Option<String>,
    },
    AzBlob {
        base_url: String,
        sas: String,
    },
    Gcs {
        prefix: String,
    },
    Nuget {
        source: String,
    },
    Script {
        template: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConfiguredProvider {
    pub(crate) config: ProviderConfig,
    pub(crate) access: CacheAccess,
}

/// Split off a trailing mode argument, defaulting to read.
fn take_mode<'a>(args: &mut Vec<&'a str>) -> Option<CacheAccess> {
    let mode = match args.last()? {
        &"read" => CacheAccess::Read,
        &"write" => CacheAccess::Write,
        &"readwrite" => CacheAccess::ReadWrite,
        _ => return None,
    };
    args.pop();
    Some(mode)
}

pub(crate) fn parse_binary_sources(
    input: &str,
    default_cache_dir: &Path,
) -> Result<Vec<ConfiguredProvider>> {
    let mut providers: Vec<ConfiguredProvider> = Vec::new();

    for segment in input.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let mut args: Vec<&str> = segment.split(',').map(str::trim).collect();
        let kind = args.remove(0);
        let mode = take_mode(&mut args);

        let config = match kind {
            "clear" => {
                ensure!(
                    args.is_empty() && mode.is_none(),
                    UnexpectedArgumentSnafu {
                        kind: "clear",
                        argument: segment,
                    }
                );
                providers.clear();
                continue;
            }
            "default" => {
                ensure!(
                    args.is_empty(),
                    UnexpectedArgumentSnafu {
                        kind: "default",
                        argument: args.join(","),
                    }
                );
                ProviderConfig::Files {
                    root: default_cache_dir.to_path_buf(),
                }
            }
            "files" => {
                ensure!(!args.is_empty(), MissingArgumentSnafu { kind: "files", what: "a path" });
                ensure!(
                    args.len() == 1,
                    UnexpectedArgumentSnafu {
                        kind: "files",
                        argument: args[1..].join(","),
                    }
                );
                let root = PathBuf::from(args[0]);
                ensure!(
                    root.is_absolute(),
                    RelativePathSnafu { kind: "files", path: root }
                );
                ProviderConfig::Files { root }
            }
            "http" => {
                ensure!(
                    !args.is_empty(),
                    MissingArgumentSnafu { kind: "http", what: "a URL template" }
                );
                ensure!(
                    args.len() <= 2,
                    UnexpectedArgumentSnafu {
                        kind: "http",
                        argument: args[2..].join(","),
                    }
                );
                let template = args[0].to_string();
                validate_template(&template, "http")?;
                ProviderConfig::Http {
                    template,
                    authorization: args.get(1).map(|s| s.to_string()),
                }
            }
            "azblob" | "x-azblob" => {
                ensure!(
                    args.len() >= 2,
                    MissingArgumentSnafu {
                        kind: "azblob",
                        what: "a container URL and a SAS token",
                    }
                );
                ensure!(
                    args.len() == 2,
                    UnexpectedArgumentSnafu {
                        kind: "azblob",
                        argument: args[2..].join(","),
                    }
                );
                let base_url = args[0].to_string();
                let parsed = Url::parse(&base_url).context(InvalidUrlSnafu {
                    kind: "azblob",
                    url: &base_url,
                })?;
                ensure!(
                    parsed.scheme() == "https",
                    NotHttpsSnafu { kind: "azblob", url: &base_url }
                );
                ProviderConfig::AzBlob {
                    base_url,
                    sas: args[1].trim_start_matches('?').to_string(),
                }
            }
            "gcs" | "x-gcs" => {
                ensure!(
                    !args.is_empty(),
                    MissingArgumentSnafu { kind: "gcs", what: "a gs:// prefix" }
                );
                ensure!(
                    args.len() == 1,
                    UnexpectedArgumentSnafu {
                        kind: "gcs",
                        argument: args[1..].join(","),
                    }
                );
                let prefix = args[0].to_string();
                ensure!(prefix.starts_with("gs://"), NotGsSchemeSnafu { prefix });
                ProviderConfig::Gcs { prefix }
            }
            "nuget" => {
                ensure!(
                    !args.is_empty(),
                    MissingArgumentSnafu { kind: "nuget", what: "a source" }
                );
                ensure!(
                    args.len() == 1,
                    UnexpectedArgumentSnafu {
                        kind: "nuget",
                        argument: args[1..].join(","),
                    }
                );
                ProviderConfig::Nuget {
                    source: args[0].to_string(),
                }
            }
            "script" | "x-script" => {
                ensure!(
                    !args.is_empty(),
                    MissingArgumentSnafu { kind: "script", what: "a command template" }
                );
                ensure!(
                    mode.is_none() || mode == Some(CacheAccess::Read),
                    UnexpectedArgumentSnafu {
                        kind: "script",
                        argument: "a write mode",
                    }
                );
                // Commas inside the command template are preserved.
                ProviderConfig::Script {
                    template: args.join(","),
                }
            }
            other => return UnknownProviderSnafu { kind: other }.fail(),
        };

        providers.push(ConfiguredProvider {
            config,
            access: mode.unwrap_or(CacheAccess::Read),
        });
    }

    Ok(providers)
}

fn validate_template(template: &str, kind: &'static str) -> Result<()> {
    ensure!(
        template.contains("{sha}"),
        TemplateWithoutShaSnafu { url: template }
    );
    let probe = template
        .replace("{sha}", "0")
        .replace("{name}", "0")
        .replace("{version}", "0")
        .replace("{triplet}", "0");
    Url::parse(&probe).context(InvalidUrlSnafu {
        kind,
        url: template,
    })?;
    Ok(())
}

/// Replace the `{sha}`, `{name}`, `{version}`, and `{triplet}` placeholders
/// literally; no additional encoding is applied.
pub(crate) fn expand_template(
    template: &str,
    sha: &str,
    name: &str,
    version: &str,
    triplet: &str,
) -> String {
    template
        .replace("{sha}", sha)
        .replace("{name}", name)
        .replace("{version}", version)
        .replace("{triplet}", triplet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Vec<ConfiguredProvider>> {
        parse_binary_sources(input, Path::new("/home/user/.cache/portsys/archives"))
    }

    #[test]
    fn default_and_modes() {
        let providers = parse("default").unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].access, CacheAccess::Read);
        assert!(matches!(providers[0].config, ProviderConfig::Files { .. }));

        let providers = parse("default,readwrite").unwrap();
        assert!(providers[0].access.read() && providers[0].access.write());

        assert!(parse("default,nonsense").is_err());
    }

    #[test]
    fn files_requires_an_absolute_path() {
        assert!(parse("files,relative/path").is_err());
        assert!(parse("files").is_err());
        let providers = parse("files,/mnt/cache,write").unwrap();
        assert_eq!(
            providers[0].config,
            ProviderConfig::Files {
                root: PathBuf::from("/mnt/cache")
            }
        );
        assert_eq!(providers[0].access, CacheAccess::Write);
        assert!(parse("files,/mnt/cache,readwrite,extra").is_err());
    }

    #[test]
    fn clear_resets_the_list() {
        let providers = parse("files,/a;clear").unwrap();
        assert!(providers.is_empty());
        let providers = parse("files,/a;clear;default").unwrap();
        assert_eq!(providers.len(), 1);
        assert!(parse("clear,upload").is_err());
    }

    #[test]
    fn http_template_validation() {
        let providers =
            parse("http,https://host/{triplet}/{name}/{sha}.zip,readwrite").unwrap();
        match &providers[0].config {
            ProviderConfig::Http { template, .. } => {
                assert_eq!(
                    expand_template(template, "abc", "zlib", "1.0", "x64-linux"),
                    "https://host/x64-linux/zlib/abc.zip"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        // No {sha} substitution.
        assert!(parse("http,https://host/constant.zip").is_err());
        assert!(parse("http,not a url {sha}").is_err());
    }

    #[test]
    fn azblob_requires_https_and_sas() {
        let providers = parse("azblob,https://account.blob.example/container,?sv=token,readwrite")
            .unwrap();
        match &providers[0].config {
            ProviderConfig::AzBlob { sas, .. } => assert_eq!(sas, "sv=token"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("azblob,http://insecure/container,sas").is_err());
        assert!(parse("azblob,https://secure/container").is_err());
    }

    #[test]
    fn gcs_and_nuget_and_script() {
        assert!(parse("gcs,gs://bucket/prefix,readwrite").is_ok());
        assert!(parse("gcs,s3://bucket").is_err());
        assert!(parse("nuget,https://nuget.example/v3/index.json").is_ok());
        assert!(parse("script,fetcher --sha {sha} --out {dst}").is_ok());
        assert!(parse("script,fetcher {sha} {dst},readwrite").is_err());
        assert!(parse("warehouse,/somewhere").is_err());
    }

    #[test]
    fn declaration_order_is_preserved() {
        let providers = parse("files,/a;http,https://h/{sha},write;default").unwrap();
        assert_eq!(providers.len(), 3);
        assert!(matches!(providers[0].config, ProviderConfig::Files { .. }));
        assert!(matches!(providers[1].config, ProviderConfig::Http { .. }));
        assert!(matches!(providers[2].config, ProviderConfig::Files { .. }));
    }
}
