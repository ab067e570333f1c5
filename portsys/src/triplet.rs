/*!
Triplet files and the dep-info variables derived from them.

A triplet file `<name>.toml` is a flat table of scalar settings for one target
configuration. Its contents feed two consumers: the platform-expression
evaluator, which sees every setting as a variable, and the ABI hasher, which
hashes the raw file text. Triplet directories are searched in priority order,
so an `overlay-triplets` directory can shadow the stock definitions.

Variables for a spec are the union of the triplet file's table, the `-`
separated segments of the triplet name (each truthy), and `native` when the
spec's triplet is the host triplet. Loading is batched: the resolver asks for
many specs at once so each triplet file is read a single time.
*/

use crate::spec::{PackageSpec, Triplet};
use log::debug;
use snafu::{OptionExt, ResultExt, Snafu};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display(
        "No triplet file for '{triplet}' in any of: {}",
        searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
    ))]
    TripletNotFound {
        triplet: Triplet,
        searched: Vec<PathBuf>,
    },

    #[snafu(display("Unable to read triplet file {}: {source}", path.display()))]
    TripletRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse triplet file {}: {source}", path.display()))]
    TripletParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Triplet file {} has a non-scalar value for '{key}'", path.display()))]
    TripletValue { path: PathBuf, key: String },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// One parsed triplet file.
#[derive(Debug)]
pub(crate) struct TripletFile {
    pub(crate) triplet: Triplet,
    pub(crate) path: PathBuf,
    /// Raw file text, hashed into every ABI for this triplet.
    pub(crate) contents: String,
    pub(crate) settings: BTreeMap<String, String>,
}

/// Locates and caches triplet files across the configured directories.
#[derive(Debug)]
pub(crate) struct TripletDatabase {
    dirs: Vec<PathBuf>,
    cache: RefCell<HashMap<Triplet, Arc<TripletFile>>>,
}

impl TripletDatabase {
    pub(crate) fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn find(&self, triplet: &Triplet) -> Result<Arc<TripletFile>> {
        if let Some(found) = self.cache.borrow().get(triplet) {
            return Ok(found.clone());
        }

        let file_name = format!("{}.toml", triplet);
        let path = self
            .dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .context(TripletNotFoundSnafu {
                triplet: triplet.clone(),
                searched: self.dirs.clone(),
            })?;

        let contents = std::fs::read_to_string(&path).context(TripletReadSnafu { path: &path })?;
        let table: toml::Table =
            toml::from_str(&contents).context(TripletParseSnafu { path: &path })?;
        let mut settings = BTreeMap::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => if b { "1" } else { "0" }.to_string(),
                _ => return TripletValueSnafu { path, key }.fail(),
            };
            settings.insert(key, value);
        }

        let file = Arc::new(TripletFile {
            triplet: triplet.clone(),
            path,
            contents,
            settings,
        });
        debug!(
            "Loaded triplet '{}' from {}",
            file.triplet,
            file.path.display()
        );
        self.cache
            .borrow_mut()
            .insert(triplet.clone(), file.clone());
        Ok(file)
    }
}

/// The resolver's window onto per-spec variables. Implementations are
/// expected to make `load_dep_info_vars` the expensive bulk entry point and
/// `dep_info_vars` a cache probe.
pub(crate) trait VarProvider {
    fn dep_info_vars(&self, spec: &PackageSpec) -> Option<Arc<BTreeMap<String, String>>>;

    fn load_dep_info_vars(&self, specs: &[PackageSpec], host: &Triplet) -> Result<()>;

    fn get_or_load_dep_info_vars(
        &self,
        spec: &PackageSpec,
        host: &Triplet,
    ) -> Result<Arc<BTreeMap<String, String>>> {
        if let Some(vars) = self.dep_info_vars(spec) {
            return Ok(vars);
        }
        self.load_dep_info_vars(std::slice::from_ref(spec), host)?;
        Ok(self
            .dep_info_vars(spec)
            .unwrap_or_else(|| Arc::new(BTreeMap::new())))
    }
}

/// Derives dep-info variables from triplet files.
#[derive(Debug)]
pub(crate) struct TripletVarProvider {
    db: TripletDatabase,
    cache: RefCell<HashMap<PackageSpec, Arc<BTreeMap<String, String>>>>,
}

impl TripletVarProvider {
    pub(crate) fn new(db: TripletDatabase) -> Self {
        Self {
            db,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn database(&self) -> &TripletDatabase {
        &self.db
    }
}

impl VarProvider for TripletVarProvider {
    fn dep_info_vars(&self, spec: &PackageSpec) -> Option<Arc<BTreeMap<String, String>>> {
        self.cache.borrow().get(spec).cloned()
    }

    fn load_dep_info_vars(&self, specs: &[PackageSpec], host: &Triplet) -> Result<()> {
        for spec in specs {
            if self.cache.borrow().contains_key(spec) {
                continue;
            }
            let file = self.db.find(&spec.triplet)?;
            let mut vars = file.settings.clone();
            for segment in spec.triplet.segments() {
                vars.entry(segment.to_string()).or_insert_with(|| "1".to_string());
            }
            if &spec.triplet == host {
                vars.insert("native".to_string(), "1".to_string());
            }
            self.cache
                .borrow_mut()
                .insert(spec.clone(), Arc::new(vars));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_triplet(dir: &std::path::Path, name: &str, contents: &str) {
        fs::write(dir.join(format!("{name}.toml")), contents).unwrap();
    }

    #[test]
    fn loads_settings_and_segments() {
        let dir = tempfile::tempdir().unwrap();
        write_triplet(dir.path(), "x64-linux", "static = true\ncrt = \"glibc\"\n");

        let provider =
            TripletVarProvider::new(TripletDatabase::new(vec![dir.path().to_path_buf()]));
        let host = Triplet::from("x64-linux");
        let spec = PackageSpec::new("zlib", host.clone());
        let vars = provider.get_or_load_dep_info_vars(&spec, &host).unwrap();

        assert_eq!(vars.get("static").map(String::as_str), Some("1"));
        assert_eq!(vars.get("crt").map(String::as_str), Some("glibc"));
        assert_eq!(vars.get("linux").map(String::as_str), Some("1"));
        assert_eq!(vars.get("x64").map(String::as_str), Some("1"));
        assert_eq!(vars.get("native").map(String::as_str), Some("1"));
    }

    #[test]
    fn overlay_directory_shadows() {
        let stock = tempfile::tempdir().unwrap();
        let overlay = tempfile::tempdir().unwrap();
        write_triplet(stock.path(), "arm64-osx", "flavor = \"stock\"");
        write_triplet(overlay.path(), "arm64-osx", "flavor = \"custom\"");

        let db = TripletDatabase::new(vec![
            overlay.path().to_path_buf(),
            stock.path().to_path_buf(),
        ]);
        let file = db.find(&Triplet::from("arm64-osx")).unwrap();
        assert_eq!(file.settings.get("flavor").map(String::as_str), Some("custom"));
    }

    #[test]
    fn missing_triplet_is_an_error() {
        let db = TripletDatabase::new(vec![PathBuf::from("/nonexistent")]);
        let err = db.find(&Triplet::from("t-missing")).unwrap_err();
        assert!(err.to_string().contains("t-missing"));
    }
}
