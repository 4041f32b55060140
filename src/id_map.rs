/// An ordered list of ID ranges mapped into a user namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMap {
    mappings: Vec<IdMapping>,
}

/// Map the range of IDs `[container_id, container_id + size) --> [host_id, host_id + size)`
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// UID and GID ranges resolved for one re-exec attempt.
///
/// Empty maps mean only the caller's own UID and GID get mapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMappings {
    pub uids: IdMap,
    pub gids: IdMap,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap {
            mappings: Vec::new(),
        }
    }

    /// A map containing only `host_id` as container ID 0.
    pub fn single(host_id: u32) -> IdMap {
        let mut map = Self::new();
        map.map_one(host_id, 0);
        map
    }

    pub fn map_one(&mut self, host_id: u32, container_id: u32) {
        self.map_many(host_id, container_id, 1);
    }

    pub fn map_many(&mut self, host_id: u32, container_id: u32, size: u32) {
        if size == 0 {
            return;
        }
        self.mappings.push(IdMapping {
            container_id,
            host_id,
            size,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdMapping> {
        self.mappings.iter()
    }

    /// Triplets handed to `newuidmap`/`newgidmap`: `host_id` becomes container root, and every
    /// range in this map moves up by one to make room for it.
    pub fn helper_triplets(&self, host_id: u32) -> Vec<IdMapping> {
        let root = IdMapping {
            container_id: 0,
            host_id,
            size: 1,
        };
        std::iter::once(root)
            .chain(self.mappings.iter().map(|m| IdMapping {
                container_id: m.container_id + 1,
                ..*m
            }))
            .collect()
    }

    /// Format the [`IdMap`] in the style of a `/proc/PID/uid_map` or `/proc/PID/gid_map` file.
    pub fn into_idmap_file_contents(&self) -> String {
        let mut contents = String::new();
        for mapping in &self.mappings {
            contents.push_str(&format!(
                "{} {} {}\n",
                mapping.container_id, mapping.host_id, mapping.size
            ));
        }
        contents
    }
}
