//! Registry of shader binaries and debug data referenced by crash dumps.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Hash the crash-dump library assigns to a shader binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderHash(pub u64);

/// Identifier of a shader debug-info blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderDebugInfoIdentifier {
    pub id: [u64; 2],
}

/// Name linking a stripped shader binary to its counterpart with debug info.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderDebugName(pub String);

/// Lookup tables used while decoding a crash dump.
///
/// Each table is keyed by the identifier the decoder asks for. Entries are
/// shared (`Arc`) so a lookup never copies the binary.
#[derive(Default)]
pub struct ShaderDatabase {
    binaries: Mutex<HashMap<ShaderHash, Arc<[u32]>>>,
    debug_infos: Mutex<HashMap<ShaderDebugInfoIdentifier, Arc<[u8]>>>,
    binaries_with_debug_info: Mutex<HashMap<ShaderDebugName, Arc<[u32]>>>,
}

impl ShaderDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shader binary under its hash. A later binary with the same
    /// hash replaces the earlier one.
    pub fn add_shader_binary(&self, hash: ShaderHash, binary: impl Into<Arc<[u32]>>) {
        self.binaries.lock().insert(hash, binary.into());
    }

    /// Register debug info emitted by the driver.
    pub fn add_shader_debug_info(
        &self,
        identifier: ShaderDebugInfoIdentifier,
        debug_info: impl Into<Arc<[u8]>>,
    ) {
        self.debug_infos.lock().insert(identifier, debug_info.into());
    }

    /// Register the unstripped binary for a shader whose stripped variant was
    /// handed to the driver.
    pub fn add_shader_with_debug_info(&self, name: ShaderDebugName, binary: impl Into<Arc<[u32]>>) {
        self.binaries_with_debug_info
            .lock()
            .insert(name, binary.into());
    }

    pub fn find_shader_binary(&self, hash: ShaderHash) -> Option<Arc<[u32]>> {
        self.binaries.lock().get(&hash).cloned()
    }

    pub fn find_shader_debug_info(&self, identifier: &ShaderDebugInfoIdentifier) -> Option<Arc<[u8]>> {
        self.debug_infos.lock().get(identifier).cloned()
    }

    pub fn find_shader_binary_with_debug_info(&self, name: &ShaderDebugName) -> Option<Arc<[u32]>> {
        self.binaries_with_debug_info.lock().get(name).cloned()
    }

    /// Number of registered shader binaries.
    pub fn shader_count(&self) -> usize {
        self.binaries.lock().len()
    }

    /// Drop every registered entry.
    pub fn clear(&self) {
        self.binaries.lock().clear();
        self.debug_infos.lock().clear();
        self.binaries_with_debug_info.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binaries_are_found_by_hash() {
        let db = ShaderDatabase::new();
        db.add_shader_binary(ShaderHash(7), vec![0x0723_0203, 1, 2]);

        let found = db.find_shader_binary(ShaderHash(7)).unwrap();
        assert_eq!(&*found, &[0x0723_0203, 1, 2]);
        assert!(db.find_shader_binary(ShaderHash(8)).is_none());
        assert_eq!(db.shader_count(), 1);
    }

    #[test]
    fn debug_info_uses_both_identifier_words() {
        let db = ShaderDatabase::new();
        let a = ShaderDebugInfoIdentifier { id: [1, 2] };
        let b = ShaderDebugInfoIdentifier { id: [1, 3] };
        db.add_shader_debug_info(a, vec![0xAA]);
        db.add_shader_debug_info(b, vec![0xBB]);

        assert_eq!(&*db.find_shader_debug_info(&a).unwrap(), &[0xAA]);
        assert_eq!(&*db.find_shader_debug_info(&b).unwrap(), &[0xBB]);
    }

    #[test]
    fn debug_names_are_distinct_keys() {
        let db = ShaderDatabase::new();
        db.add_shader_with_debug_info(ShaderDebugName("raygen".into()), vec![1]);
        db.add_shader_with_debug_info(ShaderDebugName("miss".into()), vec![2]);

        let raygen = db
            .find_shader_binary_with_debug_info(&ShaderDebugName("raygen".into()))
            .unwrap();
        assert_eq!(&*raygen, &[1]);
        assert!(db
            .find_shader_binary_with_debug_info(&ShaderDebugName("closest_hit".into()))
            .is_none());
    }

    #[test]
    fn clear_empties_every_table() {
        let db = ShaderDatabase::new();
        db.add_shader_binary(ShaderHash(1), vec![1]);
        db.add_shader_debug_info(ShaderDebugInfoIdentifier { id: [0, 1] }, vec![1]);
        db.add_shader_with_debug_info(ShaderDebugName("a".into()), vec![1]);

        db.clear();

        assert_eq!(db.shader_count(), 0);
        assert!(db
            .find_shader_debug_info(&ShaderDebugInfoIdentifier { id: [0, 1] })
            .is_none());
        assert!(db
            .find_shader_binary_with_debug_info(&ShaderDebugName("a".into()))
            .is_none());
    }
}
