use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::validate_room_name;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_room(
        &self,
        id: Ulid,
        name: &str,
        description: Option<String>,
    ) -> Result<RoomInfo, EngineError> {
        if self.state.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let name = validate_room_name(name)?;
        check_description(description.as_deref())?;

        let _gate = self.mutation_gate().await;
        // The id is reserved with the room already write-locked, so nobody
        // reads or books it before the append lands.
        let rs = Arc::new(RwLock::new(RoomState::new(id, name.clone(), description.clone())));
        let mut guard = rs.clone().try_write_owned().map_err(|_| EngineError::Concurrency {
            room_id: id,
            blocking: None,
        })?;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(e) => {
                e.insert(rs);
            }
        }
        if let Err(e) = self.claim_name(&name, id) {
            self.abandon_room(&mut guard);
            return Err(e);
        }

        let event = Event::RoomCreated {
            id,
            name,
            description,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.abandon_room(&mut guard);
            return Err(e);
        }
        let info = guard.info();
        info!("room {id} created: {}", info.name);
        Ok(info)
    }

    /// Change a room's name and/or description. `None` keeps the current
    /// value; `Some(None)` clears the description.
    pub async fn update_room(
        &self,
        id: Ulid,
        name: Option<&str>,
        description: Option<Option<String>>,
    ) -> Result<RoomInfo, EngineError> {
        let new_name = name.map(validate_room_name).transpose()?;
        if let Some(d) = &description {
            check_description(d.as_deref())?;
        }

        let mut txn = self.begin(id).await?;
        let current = txn.state().info();
        let renamed = new_name.clone().filter(|n| *n != current.name);
        if let Some(n) = &renamed {
            self.claim_name(n, id)?;
        }

        let event = Event::RoomUpdated {
            id,
            name: new_name.unwrap_or_else(|| current.name.clone()),
            description: description.unwrap_or_else(|| current.description.clone()),
        };
        if let Err(e) = txn.commit(event).await {
            if let Some(n) = &renamed {
                self.room_names.remove_if(n, |_, owner| *owner == id);
            }
            return Err(e);
        }
        if renamed.is_some() {
            self.room_names.remove_if(&current.name, |_, owner| *owner == id);
        }
        Ok(txn.state().info())
    }

    /// Delete a room together with all of its bookings.
    pub async fn delete_room(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let mut txn = self.begin(id).await?;
        txn.commit(Event::RoomDeleted { id }).await?;
        let info = txn.state().info();
        let dropped = txn.state().bookings.len();
        self.state.remove(&id);
        self.retire(txn.state_mut());
        info!("room {id} deleted with {dropped} booking(s)");
        Ok(info)
    }

    pub async fn get_room(&self, id: &Ulid) -> Option<RoomInfo> {
        let rs = self.get_room_state(id)?;
        let guard = rs.read().await;
        (!guard.retired).then(|| guard.info())
    }

    /// All rooms, ordered by name.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rooms.len());
        for rs in rooms {
            let guard = rs.read().await;
            if !guard.retired {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn room_exists(&self, id: &Ulid) -> bool {
        self.state.contains_key(id)
    }

    pub async fn room_name(&self, id: &Ulid) -> Option<String> {
        self.get_room(id).await.map(|r| r.name)
    }

    /// Undo the reservation `create_room` made for a room that never committed.
    fn abandon_room(&self, rs: &mut RoomState) {
        self.state.remove(&rs.id);
        self.retire(rs);
    }

    /// Reserve `name` for room `id`, failing if another room holds it.
    fn claim_name(&self, name: &str, id: Ulid) -> Result<(), EngineError> {
        match self.room_names.entry(name.to_string()) {
            Entry::Occupied(e) if *e.get() != id => Err(EngineError::NameTaken(name.to_string())),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }
}

fn check_description(description: Option<&str>) -> Result<(), EngineError> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => {
            Err(EngineError::LimitExceeded("room description too long"))
        }
        _ => Ok(()),
    }
}
