//! SQLite implementation of [`ModelStore`].
//!
//! [`SqliteStore`] persists model graphs in a SQLite database with WAL mode,
//! atomic transactions on every write, and automatic schema migrations.
//! Operation kinds and shapes are JSON TEXT columns; weight tensors are BLOBs
//! written by [`encode_weights`].

use rusqlite::{params, Connection, OptionalExtension};

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::{NodeId, OpId, TensorRef};
use netsurg_core::node::{NodeInstance, TensorEdge};
use netsurg_core::ops::{OpKind, Operation};

use crate::convert::{decode_weights, decompose, encode_weights, recompose, DecomposedModel};
use crate::error::StorageError;
use crate::traits::ModelStore;
use crate::types::{ModelId, ModelSummary};

/// SQLite-backed implementation of [`ModelStore`].
///
/// Every write runs inside a transaction. Foreign keys are enforced, so a
/// partial graph can never be committed.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }

    fn assert_model_exists(&self, id: ModelId) -> Result<(), StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM models WHERE id = ?1)",
            params![id.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::ModelNotFound(id.0));
        }
        Ok(())
    }

    /// Replaces every stored row of `model_id` with `decomposed`.
    /// Assumes the model row already exists.
    fn save_decomposed(
        &mut self,
        model_id: i64,
        decomposed: &DecomposedModel,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        // Children first; the cascades would cover it but the order is explicit.
        for table in ["model_tensors", "edges", "nodes", "weights", "operations"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE model_id = ?1"),
                params![model_id],
            )?;
        }

        {
            let mut op_stmt = tx.prepare_cached(
                "INSERT INTO operations (model_id, op_id, position, name, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut weight_stmt = tx.prepare_cached(
                "INSERT INTO weights (model_id, op_id, slot, shape, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (position, (op_id, op)) in decomposed.operations.iter().enumerate() {
                let kind_json = serde_json::to_string(&op.kind)?;
                op_stmt.execute(params![model_id, op_id.0, position as i64, op.name, kind_json])?;
                for (slot, w) in op.weights.iter().enumerate() {
                    let shape_json = serde_json::to_string(w.shape())?;
                    weight_stmt.execute(params![
                        model_id,
                        op_id.0,
                        slot as i64,
                        shape_json,
                        encode_weights(w),
                    ])?;
                }
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO nodes (model_id, node_id, op_id, call_index, output_shape) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (node_id, node) in &decomposed.nodes {
                let shape_json = serde_json::to_string(&node.output_shape)?;
                stmt.execute(params![
                    model_id,
                    node_id.0,
                    node.op.0,
                    node.call_index,
                    shape_json,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO edges (model_id, source_node, target_node, source_slot, target_port) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (source, target, edge) in &decomposed.edges {
                stmt.execute(params![
                    model_id,
                    source.0,
                    target.0,
                    edge.source_slot,
                    edge.target_port,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO model_tensors (model_id, role, position, node_id, slot) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (role, tensors) in [("input", &decomposed.inputs), ("output", &decomposed.outputs)] {
                for (position, t) in tensors.iter().enumerate() {
                    stmt.execute(params![model_id, role, position as i64, t.node.0, t.slot])?;
                }
            }
        }

        tx.execute(
            "UPDATE models SET next_op_id = ?1 WHERE id = ?2",
            params![decomposed.next_op_id, model_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Loads the weight tensors of one operation, ordered by slot.
    fn load_weights(&self, model_id: i64, op_id: u32) -> Result<Vec<ndarray::ArrayD<f32>>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT shape, data FROM weights WHERE model_id = ?1 AND op_id = ?2 ORDER BY slot",
        )?;
        let rows = stmt.query_map(params![model_id, op_id], |row| {
            let shape_json: String = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            Ok((shape_json, data))
        })?;
        let mut weights = Vec::new();
        for row in rows {
            let (shape_json, data) = row?;
            let shape: Vec<usize> = serde_json::from_str(&shape_json)?;
            weights.push(decode_weights(&data, &shape)?);
        }
        Ok(weights)
    }

    fn build_operation(
        &self,
        model_id: i64,
        op_id: u32,
        name: String,
        kind_json: &str,
    ) -> Result<Operation, StorageError> {
        let kind: OpKind = serde_json::from_str(kind_json)?;
        let weights = self.load_weights(model_id, op_id)?;
        Ok(Operation::from_parts(name, kind, weights)?)
    }

    fn load_tensors(&self, model_id: i64, role: &str) -> Result<Vec<TensorRef>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT node_id, slot FROM model_tensors WHERE model_id = ?1 AND role = ?2 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![model_id, role], |row| {
            Ok(TensorRef {
                node: NodeId(row.get(0)?),
                slot: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Loads all rows of a model into a [`DecomposedModel`].
    fn load_decomposed(&self, model_id: i64) -> Result<DecomposedModel, StorageError> {
        let next_op_id: u32 = self.conn.query_row(
            "SELECT next_op_id FROM models WHERE id = ?1",
            params![model_id],
            |row| row.get(0),
        )?;

        let operations: Vec<(OpId, Operation)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT op_id, name, kind FROM operations WHERE model_id = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![model_id], |row| {
                let op_id: u32 = row.get(0)?;
                let name: String = row.get(1)?;
                let kind_json: String = row.get(2)?;
                Ok((op_id, name, kind_json))
            })?;
            let mut result = Vec::new();
            for row in rows {
                let (op_id, name, kind_json) = row?;
                let op = self.build_operation(model_id, op_id, name, &kind_json)?;
                result.push((OpId(op_id), op));
            }
            result
        };

        let nodes: Vec<(NodeId, NodeInstance)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT node_id, op_id, call_index, output_shape FROM nodes WHERE model_id = ?1 ORDER BY node_id",
            )?;
            let rows = stmt.query_map(params![model_id], |row| {
                let node_id: u32 = row.get(0)?;
                let op_id: u32 = row.get(1)?;
                let call_index: u32 = row.get(2)?;
                let shape_json: String = row.get(3)?;
                Ok((node_id, op_id, call_index, shape_json))
            })?;
            let mut result = Vec::new();
            for row in rows {
                let (node_id, op_id, call_index, shape_json) = row?;
                let output_shape: Vec<usize> = serde_json::from_str(&shape_json)?;
                result.push((
                    NodeId(node_id),
                    NodeInstance::new(OpId(op_id), call_index, output_shape),
                ));
            }
            result
        };

        let edges: Vec<(NodeId, NodeId, TensorEdge)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT source_node, target_node, source_slot, target_port FROM edges WHERE model_id = ?1 ORDER BY target_node, target_port",
            )?;
            let rows = stmt.query_map(params![model_id], |row| {
                Ok((
                    NodeId(row.get(0)?),
                    NodeId(row.get(1)?),
                    TensorEdge {
                        source_slot: row.get(2)?,
                        target_port: row.get(3)?,
                    },
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(DecomposedModel {
            operations,
            nodes,
            edges,
            inputs: self.load_tensors(model_id, "input")?,
            outputs: self.load_tensors(model_id, "output")?,
            next_op_id,
        })
    }
}

impl ModelStore for SqliteStore {
    fn create_model(&mut self, name: &str) -> Result<ModelId, StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("INSERT INTO models (name) VALUES (?1)", params![name])?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(ModelId(id))
    }

    fn save_model(&mut self, id: ModelId, graph: &ModelGraph) -> Result<(), StorageError> {
        self.assert_model_exists(id)?;
        let decomposed = decompose(graph);
        self.save_decomposed(id.0, &decomposed)
    }

    fn load_model(&self, id: ModelId) -> Result<ModelGraph, StorageError> {
        self.assert_model_exists(id)?;
        let decomposed = self.load_decomposed(id.0)?;
        recompose(decomposed)
    }

    fn delete_model(&mut self, id: ModelId) -> Result<(), StorageError> {
        self.assert_model_exists(id)?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM models WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<ModelSummary>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name FROM models ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelSummary {
                id: ModelId(row.get(0)?),
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_operation(&self, id: ModelId, op: OpId) -> Result<Operation, StorageError> {
        self.assert_model_exists(id)?;
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT name, kind FROM operations WHERE model_id = ?1 AND op_id = ?2",
                params![id.0, op.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (name, kind_json) = row.ok_or(StorageError::OperationNotFound {
            model: id.0,
            op: op.0,
        })?;
        self.build_operation(id.0, op.0, name, &kind_json)
    }
}
