use std::collections::HashMap;

use crate::{cid::Signpost, connection::Connection, engine::Engine};

/// Every live connection on the shared socket, by routing key.
///
/// A connection is stored once under its primary [`Signpost`]. Further
/// signposts (the destination id of the initiation packet, for example) can
/// be registered as aliases resolving to it. Entries are only removed
/// explicitly, the table never evicts.
pub struct ConnectionTable<E: Engine> {
    connections: HashMap<Signpost, Connection<E>>,
    aliases: HashMap<Signpost, Signpost>,
}

impl<E: Engine> Default for ConnectionTable<E> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

impl<E: Engine> ConnectionTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a signpost to the primary signpost of a live connection.
    pub fn route(&self, signpost: &Signpost) -> Option<Signpost> {
        if self.connections.contains_key(signpost) {
            return Some(*signpost);
        }
        self.aliases.get(signpost).copied()
    }

    pub fn contains(&self, signpost: &Signpost) -> bool {
        self.route(signpost).is_some()
    }

    pub fn get(&self, signpost: &Signpost) -> Option<&Connection<E>> {
        let primary = self.route(signpost)?;
        self.connections.get(&primary)
    }

    pub fn get_mut(&mut self, signpost: &Signpost) -> Option<&mut Connection<E>> {
        let primary = self.route(signpost)?;
        self.connections.get_mut(&primary)
    }

    /// Insert a connection under its own signpost plus `aliases`.
    ///
    /// There is at most one connection per signpost: if the signpost or one
    /// of the aliases is taken already, the connection is handed back.
    pub fn insert(
        &mut self,
        connection: Connection<E>,
        aliases: impl IntoIterator<Item = Signpost>,
    ) -> Result<&mut Connection<E>, Connection<E>> {
        let primary = connection.signpost();
        let aliases = aliases
            .into_iter()
            .filter(|alias| *alias != primary)
            .collect::<Vec<_>>();
        if self.contains(&primary) || aliases.iter().any(|alias| self.contains(alias)) {
            return Err(connection);
        }

        for alias in aliases {
            tracing::trace!(%primary, %alias, "register alias");
            self.aliases.insert(alias, primary);
        }
        Ok(self.connections.entry(primary).or_insert(connection))
    }

    /// Remove the connection `signpost` resolves to, and all its aliases.
    pub fn remove(&mut self, signpost: &Signpost) -> Option<Connection<E>> {
        let primary = self.route(signpost)?;
        self.aliases.retain(|_, target| *target != primary);
        self.connections.remove(&primary)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Primary signposts of every live connection.
    pub fn signposts(&self) -> impl Iterator<Item = &Signpost> {
        self.connections.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Signpost, &mut Connection<E>)> {
        self.connections.iter_mut()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<E>> + '_ {
        self.aliases.clear();
        self.connections.drain().map(|(_, connection)| connection)
    }
}
