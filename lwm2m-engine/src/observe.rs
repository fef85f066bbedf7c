//! Observation table
//!
//! Tracks which server observes which path, the notification attributes
//! attached to each path, and which observations have a change waiting to
//! be notified. The table never reads values itself; the engine reads the
//! due observations through the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lwm2m_core::{Lwm2mError, Lwm2mResult, ShortServerId, Timestamp, Uri};

/// Notification attributes of one path
///
/// `pmin` is the minimum time between two notifications, `pmax` the
/// maximum time without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationAttributes {
    pub pmin: Option<u64>,
    pub pmax: Option<u64>,
}

impl NotificationAttributes {
    pub fn new(pmin: Option<u64>, pmax: Option<u64>) -> Self {
        Self { pmin, pmax }
    }

    /// # Errors
    /// `BadRequest` when `pmax` is zero or below `pmin`
    pub fn validate(&self) -> Lwm2mResult<()> {
        match (self.pmin, self.pmax) {
            (_, Some(0)) => Err(Lwm2mError::bad_request("pmax must be positive")),
            (Some(pmin), Some(pmax)) if pmax < pmin => {
                Err(Lwm2mError::bad_request(format!("pmax {} below pmin {}", pmax, pmin)))
            }
            _ => Ok(()),
        }
    }

    /// Attributes set here, falling back to `defaults` for unset ones
    pub fn or(self, defaults: NotificationAttributes) -> Self {
        Self {
            pmin: self.pmin.or(defaults.pmin),
            pmax: self.pmax.or(defaults.pmax),
        }
    }
}

/// One active observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub server: ShortServerId,
    pub uri: Uri,
    pub last_notified: Timestamp,
    /// A change under `uri` has not been notified yet
    pub pending: bool,
}

impl Observation {
    fn due(&self, attributes: NotificationAttributes, now: Timestamp) -> bool {
        self.next_deadline(attributes).is_some_and(|d| d <= now)
    }

    fn next_deadline(&self, attributes: NotificationAttributes) -> Option<Timestamp> {
        let on_change = self
            .pending
            .then(|| self.last_notified.saturating_add(attributes.pmin.unwrap_or(0)));
        let periodic = attributes
            .pmax
            .map(|pmax| self.last_notified.saturating_add(pmax));
        match (on_change, periodic) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// All observations of all servers
#[derive(Debug, Default)]
pub struct ObservationTable {
    observations: BTreeMap<(ShortServerId, Uri), Observation>,
    attributes: BTreeMap<(ShortServerId, Uri), NotificationAttributes>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start observing, or restart an existing observation
    ///
    /// Returns `true` for a new observation.
    pub fn observe(&mut self, server: ShortServerId, uri: Uri, now: Timestamp) -> bool {
        let observation = Observation {
            server,
            uri,
            last_notified: now,
            pending: false,
        };
        self.observations.insert((server, uri), observation).is_none()
    }

    pub fn cancel(&mut self, server: ShortServerId, uri: &Uri) -> bool {
        self.observations.remove(&(server, *uri)).is_some()
    }

    pub fn get(&self, server: ShortServerId, uri: &Uri) -> Option<&Observation> {
        self.observations.get(&(server, *uri))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.values()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Attach attributes to a path; all-unset attributes clear them
    pub fn set_attributes(
        &mut self,
        server: ShortServerId,
        uri: Uri,
        attributes: NotificationAttributes,
    ) -> Lwm2mResult<()> {
        attributes.validate()?;
        if attributes == NotificationAttributes::default() {
            self.attributes.remove(&(server, uri));
        } else {
            self.attributes.insert((server, uri), attributes);
        }
        Ok(())
    }

    /// Effective attributes of a path: the closest enclosing path that has any
    pub fn attributes(&self, server: ShortServerId, uri: &Uri) -> NotificationAttributes {
        let mut path = Some(*uri);
        let mut effective = NotificationAttributes::default();
        while let Some(current) = path {
            if let Some(attributes) = self.attributes.get(&(server, current)) {
                effective = effective.or(*attributes);
            }
            path = parent(&current);
        }
        effective
    }

    /// Flag every observation overlapping `uri` as pending
    ///
    /// Returns the number of observations affected.
    pub fn mark_changed(&mut self, uri: &Uri) -> usize {
        let mut count = 0;
        for observation in self.observations.values_mut() {
            if observation.uri.overlaps(uri) {
                observation.pending = true;
                count += 1;
            }
        }
        count
    }

    /// Drop observations and attributes under a path that no longer exists
    pub fn cancel_under(&mut self, uri: &Uri) -> Vec<(ShortServerId, Uri)> {
        self.attributes.retain(|(_, path), _| !uri.contains(path));
        let gone: Vec<_> = self
            .observations
            .keys()
            .filter(|(_, path)| uri.contains(path))
            .copied()
            .collect();
        for key in &gone {
            self.observations.remove(key);
        }
        gone
    }

    /// Observations to notify at `now`
    ///
    /// `defaults` yields the server-wide attributes for unset ones, or
    /// `None` for a server that cannot be notified right now; observations
    /// of such servers keep their pending flag.
    pub fn due(
        &self,
        now: Timestamp,
        defaults: impl Fn(ShortServerId) -> Option<NotificationAttributes>,
    ) -> Vec<(ShortServerId, Uri)> {
        self.observations
            .values()
            .filter(|o| {
                defaults(o.server)
                    .is_some_and(|d| o.due(self.attributes(o.server, &o.uri).or(d), now))
            })
            .map(|o| (o.server, o.uri))
            .collect()
    }

    /// Earliest time at which `due` returns something
    pub fn next_deadline(
        &self,
        defaults: impl Fn(ShortServerId) -> Option<NotificationAttributes>,
    ) -> Option<Timestamp> {
        self.observations
            .values()
            .filter_map(|o| {
                let fallback = defaults(o.server)?;
                o.next_deadline(self.attributes(o.server, &o.uri).or(fallback))
            })
            .min()
    }

    pub fn notified(&mut self, server: ShortServerId, uri: &Uri, now: Timestamp) {
        if let Some(observation) = self.observations.get_mut(&(server, *uri)) {
            observation.last_notified = now;
            observation.pending = false;
        }
    }

    /// Forget everything about a server; returns its observed paths
    pub fn remove_server(&mut self, server: ShortServerId) -> Vec<Uri> {
        self.attributes.retain(|(ssid, _), _| *ssid != server);
        let uris: Vec<Uri> = self
            .observations
            .keys()
            .filter(|(ssid, _)| *ssid == server)
            .map(|(_, uri)| *uri)
            .collect();
        self.observations.retain(|(ssid, _), _| *ssid != server);
        uris
    }
}

fn parent(uri: &Uri) -> Option<Uri> {
    let mut parent = *uri;
    if parent.resource_instance.take().is_some() {
        return Some(parent);
    }
    if parent.resource.take().is_some() {
        return Some(parent);
    }
    if parent.instance.take().is_some() {
        return Some(parent);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none(_: ShortServerId) -> Option<NotificationAttributes> {
        Some(NotificationAttributes::default())
    }

    #[test]
    fn test_observe_and_cancel() {
        let mut table = ObservationTable::new();
        assert!(table.observe(1, Uri::resource(3, 0, 9), 0));
        assert!(!table.observe(1, Uri::resource(3, 0, 9), 5));
        assert!(table.observe(2, Uri::resource(3, 0, 9), 0));
        assert_eq!(table.len(), 2);
        assert!(table.cancel(1, &Uri::resource(3, 0, 9)));
        assert!(!table.cancel(1, &Uri::resource(3, 0, 9)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_change_makes_observation_due() {
        let mut table = ObservationTable::new();
        table.observe(1, Uri::instance(3, 0), 0);
        table.observe(1, Uri::resource(3300, 0, 5700), 0);
        assert!(table.due(10, none).is_empty());

        assert_eq!(table.mark_changed(&Uri::resource(3, 0, 9)), 1);
        assert_eq!(table.due(10, none), vec![(1, Uri::instance(3, 0))]);

        table.notified(1, &Uri::instance(3, 0), 10);
        assert!(table.due(10, none).is_empty());
    }

    #[test]
    fn test_object_level_change_reaches_resource_observers() {
        let mut table = ObservationTable::new();
        table.observe(1, Uri::resource(3, 0, 9), 0);
        assert_eq!(table.mark_changed(&Uri::object(3)), 1);
        assert_eq!(table.mark_changed(&Uri::resource(3, 0, 10)), 0);
    }

    #[test]
    fn test_pmin_defers_and_pmax_forces() {
        let mut table = ObservationTable::new();
        let uri = Uri::resource(3, 0, 9);
        table.observe(1, uri, 100);
        table
            .set_attributes(1, uri, NotificationAttributes::new(Some(30), Some(300)))
            .unwrap();

        table.mark_changed(&uri);
        assert!(table.due(110, none).is_empty());
        assert_eq!(table.next_deadline(none), Some(130));
        assert_eq!(table.due(130, none), vec![(1, uri)]);

        table.notified(1, &uri, 130);
        assert_eq!(table.next_deadline(none), Some(430));
        assert_eq!(table.due(430, none), vec![(1, uri)]);
    }

    #[test]
    fn test_attributes_inherit_from_enclosing_path() {
        let mut table = ObservationTable::new();
        table
            .set_attributes(1, Uri::object(3), NotificationAttributes::new(Some(5), Some(60)))
            .unwrap();
        table
            .set_attributes(1, Uri::resource(3, 0, 9), NotificationAttributes::new(Some(1), None))
            .unwrap();
        assert_eq!(
            table.attributes(1, &Uri::resource(3, 0, 9)),
            NotificationAttributes::new(Some(1), Some(60))
        );
        assert_eq!(table.attributes(2, &Uri::resource(3, 0, 9)), NotificationAttributes::default());

        table
            .set_attributes(1, Uri::object(3), NotificationAttributes::default())
            .unwrap();
        assert_eq!(
            table.attributes(1, &Uri::resource(3, 0, 9)),
            NotificationAttributes::new(Some(1), None)
        );
    }

    #[test]
    fn test_server_defaults_apply_to_unset_attributes() {
        let mut table = ObservationTable::new();
        table.observe(1, Uri::resource(3, 0, 9), 0);
        let defaults = |_: ShortServerId| Some(NotificationAttributes::new(None, Some(60)));
        assert_eq!(table.next_deadline(defaults), Some(60));
        assert!(table.due(59, defaults).is_empty());
        assert_eq!(table.due(60, defaults).len(), 1);
    }

    #[test]
    fn test_unreachable_server_keeps_pending() {
        let mut table = ObservationTable::new();
        let uri = Uri::resource(3, 0, 9);
        table.observe(1, uri, 0);
        table.mark_changed(&uri);
        let offline = |_: ShortServerId| -> Option<NotificationAttributes> { None };
        assert!(table.due(10, offline).is_empty());
        assert_eq!(table.next_deadline(offline), None);
        assert_eq!(table.due(10, none), vec![(1, uri)]);
    }

    #[test]
    fn test_invalid_attributes() {
        let mut table = ObservationTable::new();
        let uri = Uri::resource(3, 0, 9);
        assert!(table.set_attributes(1, uri, NotificationAttributes::new(Some(10), Some(5))).is_err());
        assert!(table.set_attributes(1, uri, NotificationAttributes::new(None, Some(0))).is_err());
    }

    #[test]
    fn test_cancel_under_deleted_instance() {
        let mut table = ObservationTable::new();
        table.observe(1, Uri::resource(3300, 1, 5700), 0);
        table.observe(2, Uri::instance(3300, 1), 0);
        table.observe(1, Uri::instance(3300, 2), 0);
        table.observe(1, Uri::object(3300), 0);

        let gone = table.cancel_under(&Uri::instance(3300, 1));
        assert_eq!(gone.len(), 2);
        assert_eq!(table.len(), 2);
        assert!(table.get(1, &Uri::object(3300)).is_some());
    }

    #[test]
    fn test_remove_server() {
        let mut table = ObservationTable::new();
        table.observe(1, Uri::resource(3, 0, 9), 0);
        table.observe(1, Uri::resource(3, 0, 10), 0);
        table.observe(2, Uri::resource(3, 0, 9), 0);
        assert_eq!(table.remove_server(1).len(), 2);
        assert_eq!(table.len(), 1);
    }
}
