use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::unit::CompiledUnit;
use crate::unit::UnitName;

/// A no-argument constructor exported by the host under a symbol name.
///
/// Plugin code is linked into the host; exporting a factory is what makes it
/// reachable from a unit on disk. Factories are usually registered with
/// `inventory::submit!` and collected by [`SymbolTable::exported`].
#[derive(Clone, Copy)]
pub struct PluginFactory {
    pub symbol: &'static str,
    pub capability: &'static str,
    construct: fn() -> Box<dyn Any + Send>,
}

impl PluginFactory {
    pub const fn new(
        symbol: &'static str,
        capability: &'static str,
        construct: fn() -> Box<dyn Any + Send>,
    ) -> Self {
        Self {
            symbol,
            capability,
            construct,
        }
    }

    pub(crate) fn construct(&self) -> Box<dyn Any + Send> {
        (self.construct)()
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("symbol", &self.symbol)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

inventory::collect!(PluginFactory);

/// The trusted loader consulted before the plugin directory.
///
/// Units it knows are never read from disk.
pub trait ParentLoader: Send + Sync {
    fn find_unit(&self, name: &UnitName) -> Option<CompiledUnit>;
}

/// Parent that knows nothing; every name falls through to the directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParent;

impl ParentLoader for NoParent {
    fn find_unit(&self, _name: &UnitName) -> Option<CompiledUnit> {
        None
    }
}

/// The set of factories the host exposes to units.
///
/// This is the only surface a unit can link against: an `entry` naming any
/// other symbol fails to resolve.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<&'static str, PluginFactory>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every factory registered through `inventory::submit!` in the binary.
    pub fn exported() -> Self {
        let mut table = Self::new();
        for factory in inventory::iter::<PluginFactory> {
            table.export(*factory);
        }
        table
    }

    /// Exports `factory`; a later export of the same symbol replaces it.
    pub fn export(&mut self, factory: PluginFactory) -> &mut Self {
        if self.symbols.insert(factory.symbol, factory).is_some() {
            warn!(symbol = factory.symbol, "symbol exported twice, keeping the last");
        }
        self
    }

    pub fn with(mut self, factory: PluginFactory) -> Self {
        self.export(factory);
        self
    }

    pub fn resolve(&self, symbol: &str) -> Option<&PluginFactory> {
        self.symbols.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.symbols.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl ParentLoader for SymbolTable {
    fn find_unit(&self, name: &UnitName) -> Option<CompiledUnit> {
        self.resolve(name.as_str())
            .map(|factory| CompiledUnit::host(name.clone(), *factory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::testing::Greeter;
    use crate::capability::testing::GreeterCapability;
    use crate::capability::testing::Hello;
    use crate::capability::testing::HELLO;
    use crate::capability::testing::OTHER_CAPABILITY;
    use crate::capability::Capability;
    use crate::unit::UnitOrigin;

    inventory::submit! {
        PluginFactory::new(
            "acme.greeters.Registered",
            GreeterCapability::NAME,
            construct_registered,
        )
    }

    fn construct_registered() -> Box<dyn Any + Send> {
        Box::new(Box::new(Hello) as Box<dyn Greeter>)
    }

    #[test]
    fn test_exported_collects_inventory() {
        let table = SymbolTable::exported();
        let factory = table.resolve("acme.greeters.Registered").unwrap();
        assert_eq!(factory.capability, GreeterCapability::NAME);
    }

    #[test]
    fn test_resolve_only_exported_symbols() {
        let table = SymbolTable::new().with(HELLO).with(OTHER_CAPABILITY);
        assert_eq!(table.len(), 2);
        assert!(table.resolve("acme.greeters.Hello").is_some());
        assert!(table.resolve("acme.greeters.Secret").is_none());
        assert_eq!(
            table.symbols().collect::<Vec<_>>(),
            vec!["acme.greeters.Hello", "acme.other.Thing"]
        );
    }

    #[test]
    fn test_duplicate_export_keeps_the_last() {
        let mut table = SymbolTable::new();
        table
            .export(HELLO)
            .export(PluginFactory::new("acme.greeters.Hello", "test.Other", construct_registered));
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("acme.greeters.Hello").unwrap().capability, "test.Other");
    }

    #[test]
    fn test_symbol_table_serves_host_units() {
        let table = SymbolTable::new().with(HELLO);
        let name = UnitName::parse("acme.greeters.Hello").unwrap();
        let unit = table.find_unit(&name).unwrap();
        assert_eq!(unit.origin(), &UnitOrigin::Host);
        assert!(unit.implements(GreeterCapability::NAME));

        let missing = UnitName::parse("acme.greeters.Nope").unwrap();
        assert!(table.find_unit(&missing).is_none());
        assert!(NoParent.find_unit(&name).is_none());
    }
}
