/// Document-Store Backend Module
///
/// Native driver for the `document-store` backend on top of the `mongodb`
/// crate's synchronous client. The query builder speaks SQL, so each
/// statement it renders is translated into a collection operation before it
/// is sent: selects become finds (or a document count for
/// `COUNT(*) AS aggregate`), inserts become `insert_one`, updates become
/// `update_many` with `$set` and deletes become `delete_many`.
///
/// Only the shapes the builder produces are understood. Conditions must be
/// `col <op> ?`, `col <op> <literal>`, `col IN (...)` or `col IS [NOT] NULL`,
/// optionally negated, joined by `AND`. Joins and anything else are
/// rejected with a query error.

use crate::config::DriverKind;
use crate::core::db::connection::{Dialer, NativeHandle};
use crate::core::db::connector::{ConnectPlan, Target};
use crate::core::{DataError, Result, ResultSet, Row, Value};
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::sync::{Client, Database};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::vec::IntoIter;
use tracing::debug;

const DRIVER: DriverKind = DriverKind::DocumentStore;
const COUNT_COLUMN: &str = "COUNT(*) AS aggregate";

static SELECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^SELECT (?P<cols>.+?) FROM (?P<table>[A-Za-z0-9_.]+)(?: WHERE (?P<where>.+?))?(?: ORDER BY (?P<order>.+?))?(?: LIMIT (?P<limit>\d+))?$",
    )
    .expect("valid select pattern")
});
static INSERT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^INSERT INTO (?P<table>[A-Za-z0-9_.]+) \((?P<cols>[^)]*)\) VALUES \((?P<vals>[^)]*)\)$")
        .expect("valid insert pattern")
});
static UPDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^UPDATE (?P<table>[A-Za-z0-9_.]+) SET (?P<set>.+?)(?: WHERE (?P<where>.+))?$")
        .expect("valid update pattern")
});
static DELETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^DELETE FROM (?P<table>[A-Za-z0-9_.]+)(?: WHERE (?P<where>.+))?$")
        .expect("valid delete pattern")
});
static CONDITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<not>NOT )?(?P<col>[A-Za-z_][A-Za-z0-9_.]*) (?:(?P<null>IS (?:NOT )?NULL)|IN \((?P<list>[^)]*)\)|(?P<op>=|!=|<>|<=|>=|<|>) (?P<rhs>.+))$",
    )
    .expect("valid condition pattern")
});

/// A builder statement expressed as a collection operation.
#[derive(Debug, Clone, PartialEq)]
enum DocumentOp {
    Find {
        collection: String,
        /// Requested fields; empty for all
        fields: Vec<String>,
        filter: Document,
        sort: Document,
        limit: Option<i64>,
    },
    Count {
        collection: String,
        filter: Document,
    },
    Insert {
        collection: String,
        document: Document,
    },
    Update {
        collection: String,
        filter: Document,
        set: Document,
    },
    Delete {
        collection: String,
        filter: Document,
    },
}

fn unsupported(sql: &str) -> DataError {
    DataError::Query(format!("document-store backend cannot run '{}'", sql))
}

/// Hands out bound values in placeholder order.
struct Bindings {
    values: IntoIter<Value>,
}

impl Bindings {
    fn new(params: &[Value]) -> Self {
        Bindings {
            values: params.to_vec().into_iter(),
        }
    }

    fn next(&mut self) -> Result<Bson> {
        self.values
            .next()
            .map(|v| to_bson(&v))
            .ok_or_else(|| DataError::Query("fewer bound values than placeholders".to_string()))
    }

    /// A `?` marker or an inline literal.
    fn operand(&mut self, text: &str) -> Result<Bson> {
        let text = text.trim();
        if text == "?" {
            return self.next();
        }
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Bson::Int64(i));
        }
        if let Ok(f) = text.parse::<f64>() {
            return Ok(Bson::Double(f));
        }
        match text.to_ascii_uppercase().as_str() {
            "TRUE" => return Ok(Bson::Boolean(true)),
            "FALSE" => return Ok(Bson::Boolean(false)),
            "NULL" => return Ok(Bson::Null),
            _ => {}
        }
        if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
            return Ok(Bson::String(text[1..text.len() - 1].replace("''", "'")));
        }
        Err(DataError::Query(format!("unsupported operand '{}'", text)))
    }

    fn finish(mut self) -> Result<()> {
        match self.values.next() {
            Some(_) => Err(DataError::Query("more bound values than placeholders".to_string())),
            None => Ok(()),
        }
    }
}

fn split_list(text: &str) -> Vec<&str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn condition(text: &str, bindings: &mut Bindings) -> Result<Document> {
    let caps = CONDITION
        .captures(text.trim())
        .ok_or_else(|| DataError::Query(format!("unsupported condition '{}'", text.trim())))?;
    let column = caps["col"].to_string();

    let test = if let Some(null) = caps.name("null") {
        if null.as_str().contains("NOT") {
            doc! { column: { "$ne": Bson::Null } }
        } else {
            doc! { column: Bson::Null }
        }
    } else if let Some(list) = caps.name("list") {
        let values = split_list(list.as_str())
            .into_iter()
            .map(|item| bindings.operand(item))
            .collect::<Result<Vec<_>>>()?;
        doc! { column: { "$in": values } }
    } else {
        let value = bindings.operand(&caps["rhs"])?;
        let op = match &caps["op"] {
            "=" => return Ok(negate(caps.name("not").is_some(), doc! { column: value })),
            "!=" | "<>" => "$ne",
            "<" => "$lt",
            "<=" => "$lte",
            ">" => "$gt",
            _ => "$gte",
        };
        doc! { column: { op: value } }
    };
    Ok(negate(caps.name("not").is_some(), test))
}

fn negate(not: bool, test: Document) -> Document {
    if not {
        doc! { "$nor": [test] }
    } else {
        test
    }
}

fn filter(clause: Option<&str>, bindings: &mut Bindings) -> Result<Document> {
    let Some(clause) = clause else {
        return Ok(Document::new());
    };
    let mut tests = clause
        .split(" AND ")
        .map(|part| condition(part, bindings))
        .collect::<Result<Vec<_>>>()?;
    Ok(if tests.len() == 1 {
        tests.remove(0)
    } else {
        doc! { "$and": tests }
    })
}

fn sort(clause: Option<&str>) -> Result<Document> {
    let mut sort = Document::new();
    for part in clause.map(split_list).unwrap_or_default() {
        let (column, direction) = part.rsplit_once(' ').unwrap_or((part, "ASC"));
        let order = match direction {
            "ASC" => 1,
            "DESC" => -1,
            other => return Err(DataError::Query(format!("unsupported sort direction '{}'", other))),
        };
        sort.insert(column.trim(), order);
    }
    Ok(sort)
}

fn translate(sql: &str, params: &[Value]) -> Result<DocumentOp> {
    let mut bindings = Bindings::new(params);

    let op = if let Some(caps) = SELECT.captures(sql) {
        let collection = caps["table"].to_string();
        let filter = filter(caps.name("where").map(|m| m.as_str()), &mut bindings)?;
        let cols = &caps["cols"];
        if cols == COUNT_COLUMN {
            DocumentOp::Count { collection, filter }
        } else {
            let fields = match cols {
                "*" => Vec::new(),
                list => split_list(list).into_iter().map(String::from).collect(),
            };
            let limit = caps
                .name("limit")
                .map(|m| m.as_str().parse::<i64>())
                .transpose()
                .map_err(|_| unsupported(sql))?;
            DocumentOp::Find {
                collection,
                fields,
                filter,
                sort: sort(caps.name("order").map(|m| m.as_str()))?,
                limit,
            }
        }
    } else if let Some(caps) = INSERT.captures(sql) {
        let columns = split_list(&caps["cols"]);
        let markers = split_list(&caps["vals"]);
        if columns.len() != markers.len() {
            return Err(unsupported(sql));
        }
        let mut document = Document::new();
        for (column, marker) in columns.into_iter().zip(markers) {
            document.insert(column, bindings.operand(marker)?);
        }
        DocumentOp::Insert {
            collection: caps["table"].to_string(),
            document,
        }
    } else if let Some(caps) = UPDATE.captures(sql) {
        let mut set = Document::new();
        for assignment in split_list(&caps["set"]) {
            let (column, rhs) = assignment.split_once(" = ").ok_or_else(|| unsupported(sql))?;
            set.insert(column.trim(), bindings.operand(rhs)?);
        }
        DocumentOp::Update {
            collection: caps["table"].to_string(),
            filter: filter(caps.name("where").map(|m| m.as_str()), &mut bindings)?,
            set,
        }
    } else if let Some(caps) = DELETE.captures(sql) {
        DocumentOp::Delete {
            collection: caps["table"].to_string(),
            filter: filter(caps.name("where").map(|m| m.as_str()), &mut bindings)?,
        }
    } else {
        return Err(unsupported(sql));
    };

    bindings.finish()?;
    Ok(op)
}

fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Integer(i) => Bson::Int64(*i),
        Value::Real(r) => Bson::Double(*r),
        Value::Text(t) => Bson::String(t.clone()),
        Value::Blob(b) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: b.clone(),
        }),
    }
}

fn from_bson(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Integer(i64::from(*i)),
        Bson::Int64(i) => Value::Integer(*i),
        Bson::Double(d) => Value::Real(*d),
        Bson::String(s) => Value::Text(s.clone()),
        Bson::Binary(b) => Value::Blob(b.bytes.clone()),
        Bson::ObjectId(id) => Value::Text(id.to_hex()),
        Bson::DateTime(dt) => Value::Text(dt.try_to_rfc3339_string().unwrap_or_else(|_| dt.to_string())),
        other => Value::Text(other.to_string()),
    }
}

/// Transport and server-selection failures are connection errors.
fn classify(err: mongodb::error::Error) -> DataError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            DataError::connection(DRIVER, err.to_string())
        }
        _ => DataError::Query(err.to_string()),
    }
}

/// Opens `mongodb` clients for `Target::Options` plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDialer;

fn client_options(options: &BTreeMap<String, String>, plan: &ConnectPlan) -> Result<ClientOptions> {
    let host = options.get("host").cloned().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match options.get("port").filter(|p| !p.is_empty()) {
        Some(raw) => Some(
            raw.parse::<u16>()
                .map_err(|_| DataError::connection(DRIVER, format!("invalid port '{}'", raw)))?,
        ),
        None => None,
    };

    let mut client_options = ClientOptions::default();
    client_options.hosts = vec![ServerAddress::Tcp { host, port }];
    client_options.connect_timeout = plan.timeout;
    client_options.server_selection_timeout = plan.timeout;
    client_options.app_name = options.get("appName").cloned();
    client_options.repl_set_name = options.get("replicaSet").cloned();
    client_options.default_database = options.get("database").cloned();
    if let Some(username) = options.get("username") {
        let mut credential = Credential::default();
        credential.username = Some(username.clone());
        credential.password = options.get("password").cloned();
        credential.source = options.get("authSource").cloned();
        client_options.credential = Some(credential);
    }
    Ok(client_options)
}

impl Dialer for MongoDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        let options = match &plan.target {
            Target::Options(options) => options,
            other => {
                return Err(DataError::connection(
                    DRIVER,
                    format!("mongodb driver cannot open a {} target", other.kind()),
                ))
            }
        };
        let database = options
            .get("database")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DataError::connection(DRIVER, "document-store backend requires a database"))?;

        let client = Client::with_options(client_options(options, plan)?)
            .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;
        let db = client.database(database);
        // The client connects lazily; ping so bad hosts fail here.
        db.run_command(doc! { "ping": 1 })
            .run()
            .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;

        debug!(target = %plan.target.redacted(), "opened mongodb client");
        Ok(Box::new(MongoHandle { db: Some(db) }))
    }
}

pub struct MongoHandle {
    db: Option<Database>,
}

impl MongoHandle {
    fn db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| DataError::connection(DRIVER, "handle is closed"))
    }
}

fn document_row(doc: &Document, fields: &[String]) -> Row {
    if fields.is_empty() {
        doc.iter().map(|(k, v)| (k.clone(), from_bson(v))).collect()
    } else {
        fields
            .iter()
            .map(|f| (f.clone(), doc.get(f).map(from_bson).unwrap_or(Value::Null)))
            .collect()
    }
}

impl NativeHandle for MongoHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let db = self.db()?;
        match translate(sql, params)? {
            DocumentOp::Count { collection, filter } => {
                let n = db
                    .collection::<Document>(&collection)
                    .count_documents(filter)
                    .run()
                    .map_err(classify)?;
                let row = Row::new().with("aggregate", Value::Integer(n as i64));
                Ok(ResultSet::new(vec!["aggregate".to_string()], vec![row]))
            }
            DocumentOp::Find {
                collection,
                fields,
                filter,
                sort,
                limit,
            } => {
                let coll = db.collection::<Document>(&collection);
                let mut find = coll.find(filter).sort(sort);
                if let Some(n) = limit {
                    find = find.limit(n);
                }
                if !fields.is_empty() {
                    let mut projection: Document = fields.iter().map(|f| (f.clone(), Bson::Int32(1))).collect();
                    if !fields.iter().any(|f| f == "_id") {
                        projection.insert("_id", 0);
                    }
                    find = find.projection(projection);
                }

                let mut rows = Vec::new();
                for doc in find.run().map_err(classify)? {
                    rows.push(document_row(&doc.map_err(classify)?, &fields));
                }
                let columns = if fields.is_empty() {
                    rows.first().map(|r| r.columns().to_vec()).unwrap_or_default()
                } else {
                    fields
                };
                Ok(ResultSet::new(columns, rows))
            }
            _ => Err(DataError::Query(format!("'{}' does not return rows", sql))),
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let db = self.db()?;
        match translate(sql, params)? {
            DocumentOp::Insert { collection, document } => {
                db.collection::<Document>(&collection)
                    .insert_one(document)
                    .run()
                    .map_err(classify)?;
                Ok(1)
            }
            DocumentOp::Update { collection, filter, set } => Ok(db
                .collection::<Document>(&collection)
                .update_many(filter, doc! { "$set": set })
                .run()
                .map_err(classify)?
                .modified_count),
            DocumentOp::Delete { collection, filter } => Ok(db
                .collection::<Document>(&collection)
                .delete_many(filter)
                .run()
                .map_err(classify)?
                .deleted_count),
            _ => Err(DataError::Query(format!("'{}' is not a mutating statement", sql))),
        }
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        Err(DataError::Query(format!(
            "document-store backend has no session command '{}'",
            command
        )))
    }

    fn close(&mut self) -> Result<()> {
        self.db.take();
        Ok(())
    }
}
