//! Linear search over entry fields

use crate::database::Database;
use crate::entry::Entry;
use crate::group::Group;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the KDB v3 group whose entries are hidden from search
pub const BACKUP_GROUP_NAME: &str = "Backup";

/// Which fields to scan and which entries to skip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParameters {
    pub search_in_titles: bool,
    pub search_in_usernames: bool,
    pub search_in_passwords: bool,
    pub search_in_urls: bool,
    pub search_in_notes: bool,
    pub search_in_group_names: bool,
    /// Custom string fields
    pub search_in_other_fields: bool,
    pub search_in_uuids: bool,
    pub ignore_case: bool,
    pub exclude_expired: bool,
    /// Skip groups with searching disabled, the recycle bin included
    pub respect_searching_disabled: bool,
    /// Skip the KDB v3 top-level "Backup" group
    pub omit_backup: bool,
    pub max_results: Option<usize>,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            search_in_titles: true,
            search_in_usernames: true,
            search_in_passwords: false,
            search_in_urls: true,
            search_in_notes: true,
            search_in_group_names: false,
            search_in_other_fields: true,
            search_in_uuids: false,
            ignore_case: true,
            exclude_expired: false,
            respect_searching_disabled: true,
            omit_backup: true,
            max_results: None,
        }
    }
}

struct Matcher<'q> {
    query: &'q str,
    ignore_case: bool,
}

impl Matcher<'_> {
    fn matches(&self, value: &str) -> bool {
        if self.ignore_case {
            value.to_lowercase().contains(self.query)
        } else {
            value.contains(self.query)
        }
    }
}

/// Entries matching `query`, in tree order.
///
/// An empty query matches nothing. The first matching field decides.
pub fn search<'a>(db: &'a Database, query: &str, params: &SearchParameters) -> Vec<&'a Entry> {
    let mut results = Vec::new();
    if query.is_empty() {
        return results;
    }
    let folded;
    let matcher = Matcher {
        query: if params.ignore_case {
            folded = query.to_lowercase();
            &folded
        } else {
            query
        },
        ignore_case: params.ignore_case,
    };
    let limit = params.max_results.unwrap_or(usize::MAX);
    search_group(db, db.root_group(), true, &matcher, params, limit, &mut results);
    results
}

fn search_group<'a>(
    db: &'a Database,
    group: &'a Group,
    inherited_searchable: bool,
    matcher: &Matcher<'_>,
    params: &SearchParameters,
    limit: usize,
    results: &mut Vec<&'a Entry>,
) {
    if results.len() >= limit {
        return;
    }
    let searchable = group.enable_searching.unwrap_or(inherited_searchable);
    if is_skipped(db, group, searchable, params) {
        return;
    }

    for entry in db.entries_in_group(&group.uuid) {
        if results.len() >= limit {
            return;
        }
        if entry.is_meta_stream() || (params.exclude_expired && entry.is_expired()) {
            continue;
        }
        if entry_matches(entry, group, matcher, params) {
            results.push(entry);
        }
    }

    for child in db.child_groups(&group.uuid) {
        search_group(db, child, searchable, matcher, params, limit, results);
    }
}

fn is_skipped(db: &Database, group: &Group, searchable: bool, params: &SearchParameters) -> bool {
    if db.format().is_kdb() {
        return params.omit_backup
            && group.parent == Some(db.root_uuid())
            && group.name.eq_ignore_ascii_case(BACKUP_GROUP_NAME);
    }
    params.respect_searching_disabled
        && (!searchable || db.meta.recycle_bin() == Some(group.uuid))
}

fn entry_matches(
    entry: &Entry,
    group: &Group,
    matcher: &Matcher<'_>,
    params: &SearchParameters,
) -> bool {
    let standard = [
        (params.search_in_titles, &entry.title),
        (params.search_in_usernames, &entry.username),
        (params.search_in_passwords, &entry.password),
        (params.search_in_urls, &entry.url),
        (params.search_in_notes, &entry.notes),
    ];
    for (enabled, value) in standard {
        if enabled && matcher.matches(&value.reveal()) {
            return true;
        }
    }
    if params.search_in_other_fields
        && entry
            .custom_fields
            .values()
            .any(|value| matcher.matches(&value.reveal()))
    {
        return true;
    }
    if params.search_in_group_names && matcher.matches(&group.name) {
        return true;
    }
    params.search_in_uuids && uuid_matches(&entry.uuid, matcher)
}

fn uuid_matches(uuid: &Uuid, matcher: &Matcher<'_>) -> bool {
    matcher.matches(&uuid.simple().to_string()) || matcher.matches(&uuid.hyphenated().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;
    use crate::group::GroupBuilder;
    use crate::key::Credentials;

    fn db_with(entries: Vec<Entry>) -> Database {
        let mut db = Database::new("Search", Credentials::from_password("pw"));
        for entry in entries {
            db.add_entry(entry).unwrap();
        }
        db
    }

    #[test]
    fn test_search_title_case_insensitive() {
        let db = db_with(vec![Entry::new("MyPassword")]);
        let params = SearchParameters::default();
        assert_eq!(db.search("pass", &params).len(), 1);

        let no_titles = SearchParameters {
            search_in_titles: false,
            ..SearchParameters::default()
        };
        assert!(db.search("pass", &no_titles).is_empty());
    }

    #[test]
    fn test_case_sensitive() {
        let db = db_with(vec![Entry::new("MyPassword")]);
        let params = SearchParameters {
            ignore_case: false,
            ..SearchParameters::default()
        };
        assert!(db.search("pass", &params).is_empty());
        assert_eq!(db.search("Pass", &params).len(), 1);
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let db = db_with(vec![Entry::new("anything")]);
        assert!(db.search("", &SearchParameters::default()).is_empty());
    }

    #[test]
    fn test_passwords_only_when_enabled() {
        let db = db_with(vec![EntryBuilder::new("site").password("hunter2").build()]);
        assert!(db.search("hunter", &SearchParameters::default()).is_empty());
        let params = SearchParameters {
            search_in_passwords: true,
            ..SearchParameters::default()
        };
        assert_eq!(db.search("hunter", &params).len(), 1);
    }

    #[test]
    fn test_searching_disabled_is_inherited() {
        let mut db = db_with(vec![]);
        let hidden = db
            .add_group(GroupBuilder::new("Hidden").searchable(false).build())
            .unwrap();
        let nested = db
            .add_group(GroupBuilder::new("Nested").parent(hidden).build())
            .unwrap();
        db.add_entry(EntryBuilder::new("secret thing").parent_group(nested).build())
            .unwrap();
        db.add_entry(Entry::new("public thing")).unwrap();

        let found = db.search("thing", &SearchParameters::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title.reveal().as_str(), "public thing");

        let everything = SearchParameters {
            respect_searching_disabled: false,
            ..SearchParameters::default()
        };
        assert_eq!(db.search("thing", &everything).len(), 2);
    }

    #[test]
    fn test_recycle_bin_is_skipped() {
        let mut db = db_with(vec![]);
        let gone = db.add_entry(Entry::new("gone")).unwrap();
        db.recycle_entry(&gone).unwrap();
        assert!(db.search("gone", &SearchParameters::default()).is_empty());
    }

    #[test]
    fn test_kdb_backup_group_is_omitted() {
        let mut db = Database::new_kdb(Credentials::from_password("pw"));
        let backup = db.add_group(Group::new("Backup")).unwrap();
        db.add_entry(EntryBuilder::new("old copy").parent_group(backup).build())
            .unwrap();
        assert!(db.search("copy", &SearchParameters::default()).is_empty());

        let params = SearchParameters {
            omit_backup: false,
            ..SearchParameters::default()
        };
        assert_eq!(db.search("copy", &params).len(), 1);
    }

    #[test]
    fn test_max_results_and_order() {
        let db = db_with(vec![Entry::new("a1"), Entry::new("a2"), Entry::new("a3")]);
        let params = SearchParameters {
            max_results: Some(2),
            ..SearchParameters::default()
        };
        let found = db.search("a", &params);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title.reveal().as_str(), "a1");
        assert_eq!(found[1].title.reveal().as_str(), "a2");
    }

    #[test]
    fn test_uuid_search() {
        let entry = Entry::new("x");
        let needle = entry.uuid.simple().to_string()[..8].to_string();
        let db = db_with(vec![entry]);
        let params = SearchParameters {
            search_in_uuids: true,
            ..SearchParameters::default()
        };
        assert_eq!(db.search(&needle, &params).len(), 1);
    }
}
