//! Product name inputs.
//!
//! Products come either from the command line or from list files. A list
//! file is JSON (`.json` extension) holding a list of names or a map of
//! `key -> list`, or plain text with one name per line. The key becomes a
//! sub-directory of the output root; names given without a key use `""`.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Output key → product names, each list free of duplicates.
pub type ProductTree = BTreeMap<String, Vec<String>>;

/// Items in first-seen order, duplicates dropped.
pub fn unique<T, I>(items: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Strip archive and product directory suffixes: `X.zip`, `X.SAFE`, `X.SAFE.zip`.
pub fn normalize_product_name(name: &str) -> String {
    let mut name = name.trim();
    loop {
        let stripped = name
            .strip_suffix(".zip")
            .or_else(|| name.strip_suffix(".SAFE"));
        match stripped {
            Some(rest) => name = rest,
            None => return name.to_string(),
        }
    }
}

/// Tree for products given directly, all under the empty key.
pub fn products_from_args<S: AsRef<str>>(names: &[S]) -> ProductTree {
    let products = unique(names.iter().map(|n| normalize_product_name(n.as_ref())));
    ProductTree::from([(String::new(), products)])
}

/// Append `other` to `tree` per key, keeping each list free of duplicates.
pub fn merge_trees(tree: &mut ProductTree, other: ProductTree) {
    for (key, products) in other {
        let list = tree.entry(key).or_default();
        list.extend(products);
        *list = unique(list.drain(..));
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonProductList {
    List(Vec<String>),
    Keyed(BTreeMap<String, Vec<String>>),
}

/// Load and merge product list files.
///
/// Lists for the same key are concatenated in file order and de-duplicated
/// per key.
pub fn load_product_lists<P: AsRef<Path>>(paths: &[P]) -> Result<ProductTree> {
    let mut tree = ProductTree::new();
    for path in paths {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let lists = if is_json {
            parse_json_list(&text).map_err(|e| {
                Error::InvalidInput(format!("{}: {e}", path.display()))
            })?
        } else {
            BTreeMap::from([(String::new(), parse_text_list(&text))])
        };

        for (key, products) in lists {
            debug!(file = %path.display(), key = %key, count = products.len(), "loaded product list");
            tree.entry(key).or_default().extend(products);
        }
    }

    for products in tree.values_mut() {
        *products = unique(products.iter().map(|p| normalize_product_name(p)));
    }
    Ok(tree)
}

fn parse_json_list(text: &str) -> serde_json::Result<BTreeMap<String, Vec<String>>> {
    Ok(match serde_json::from_str(text)? {
        JsonProductList::List(products) => BTreeMap::from([(String::new(), products)]),
        JsonProductList::Keyed(map) => map,
    })
}

/// One name per line; blank lines and `#` comments are skipped.
fn parse_text_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
