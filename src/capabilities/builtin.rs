//! Declarations of the built-in shell classes.

use super::signature::{ApiVersionRange, ClassSpec, MethodSpec, Topology, VersionRange};

/// Method names that configure a cursor and return it for chaining.
fn chainable(names: &[&str]) -> Vec<MethodSpec> {
    names
        .iter()
        .map(|n| MethodSpec::new(*n).returns_this())
        .collect()
}

fn with_methods(mut class: ClassSpec, methods: Vec<MethodSpec>) -> ClassSpec {
    class.methods.extend(methods);
    class
}

/// Declarations shared by every non-change-stream cursor.
fn abstract_cursor() -> ClassSpec {
    let class = ClassSpec::new("AbstractCursor")
        .method(MethodSpec::new("close").returns_promise())
        .method(MethodSpec::new("forEach").returns_promise())
        .method(MethodSpec::new("hasNext").returns_promise().returns_primitive("boolean"))
        .method(MethodSpec::new("next").returns_promise())
        .method(MethodSpec::new("tryNext").returns_promise())
        .method(MethodSpec::new("toArray").returns_promise().returns_primitive("array"))
        .method(MethodSpec::new("itcount").returns_promise().returns_primitive("number"))
        .method(MethodSpec::new("isClosed").returns_primitive("boolean"))
        .method(MethodSpec::new("isExhausted").returns_primitive("boolean"))
        .method(MethodSpec::new("objsLeftInBatch").returns_primitive("number"))
        .method(MethodSpec::new("_it").returns_promise());
    with_methods(class, chainable(&["map", "batchSize", "maxTimeMS", "pretty"]))
}

fn find_cursor() -> ClassSpec {
    let class = ClassSpec::new("Cursor")
        .extends("AbstractCursor")
        .with_help(true)
        .method(MethodSpec::new("collation").returns_this().server_versions(VersionRange::since("3.4.0")))
        .method(MethodSpec::new("allowDiskUse").returns_this().server_versions(VersionRange::since("4.4.0")))
        .method(MethodSpec::new("oplogReplay").returns_this().deprecated().api_versions(ApiVersionRange::new(1, 0)))
        .method(MethodSpec::new("count").returns_promise().returns_primitive("number"))
        .method(MethodSpec::new("size").returns_promise().returns_primitive("number"))
        .method(MethodSpec::new("explain").returns_promise().returns_class("ExplainOutput"));
    let since_32 = ["comment", "maxAwaitTimeMS", "returnKey", "showRecordId", "tailable"]
        .iter()
        .map(|n| {
            MethodSpec::new(*n)
                .returns_this()
                .server_versions(VersionRange::since("3.2.0"))
        })
        .collect();
    let class = with_methods(class, since_32);
    with_methods(
        class,
        chainable(&[
            "addOption",
            "allowPartialResults",
            "hint",
            "limit",
            "max",
            "min",
            "noCursorTimeout",
            "projection",
            "readPref",
            "skip",
            "sort",
        ]),
    )
}

fn aggregation_cursor() -> ClassSpec {
    let class = ClassSpec::new("AggregationCursor")
        .extends("AbstractCursor")
        .with_help(true)
        .method(MethodSpec::new("explain").returns_promise().returns_class("ExplainOutput"));
    with_methods(class, chainable(&["projection", "skip", "sort"]))
}

fn run_command_cursor() -> ClassSpec {
    ClassSpec::new("RunCommandCursor")
        .extends("AbstractCursor")
        .with_help(true)
}

fn change_stream_cursor() -> ClassSpec {
    let class = ClassSpec::new("ChangeStreamCursor")
        .with_help(true)
        .method(MethodSpec::new("close").returns_promise())
        .method(MethodSpec::new("hasNext").returns_promise().deprecated().returns_primitive("boolean"))
        .method(MethodSpec::new("next").returns_promise())
        .method(MethodSpec::new("tryNext").returns_promise())
        .method(MethodSpec::new("forEach").returns_promise())
        .method(MethodSpec::new("toArray").returns_promise())
        .method(MethodSpec::new("itcount").returns_promise().returns_primitive("number"))
        .method(MethodSpec::new("isClosed").returns_primitive("boolean"))
        .method(MethodSpec::new("isExhausted").returns_primitive("boolean"))
        .method(MethodSpec::new("objsLeftInBatch").returns_primitive("number"))
        .method(MethodSpec::new("getResumeToken"))
        .method(MethodSpec::new("_it").returns_promise());
    with_methods(class, chainable(&["map", "batchSize", "maxTimeMS", "pretty"]))
}

fn collection() -> ClassSpec {
    let streams = [Topology::ReplSet, Topology::Sharded, Topology::LoadBalanced];
    ClassSpec::new("Collection")
        .with_help(true)
        .method(MethodSpec::new("find").returns_class("Cursor"))
        .method(MethodSpec::new("aggregate").returns_class("AggregationCursor"))
        .method(
            MethodSpec::new("watch")
                .returns_class("ChangeStreamCursor")
                .topologies(&streams)
                .server_versions(VersionRange::since("3.1.0")),
        )
        .method(MethodSpec::new("insertOne").returns_promise().returns_class("InsertOneResult"))
        .method(MethodSpec::new("insertMany").returns_promise().returns_class("InsertManyResult"))
        .method(MethodSpec::new("updateOne").returns_promise().returns_class("UpdateResult"))
        .method(MethodSpec::new("updateMany").returns_promise().returns_class("UpdateResult"))
        .method(MethodSpec::new("deleteOne").returns_promise().returns_class("DeleteResult"))
        .method(MethodSpec::new("deleteMany").returns_promise().returns_class("DeleteResult"))
        .method(MethodSpec::new("bulkWrite").returns_promise().returns_class("BulkWriteResult"))
}

fn database() -> ClassSpec {
    ClassSpec::new("Database")
        .with_help(true)
        .method(MethodSpec::new("aggregate").returns_class("AggregationCursor"))
        .method(MethodSpec::new("runCursorCommand").returns_class("RunCommandCursor"))
        .method(
            MethodSpec::new("runCommand")
                .returns_promise()
                .returns_class("CommandResult")
                .api_versions(ApiVersionRange::new(1, u32::MAX)),
        )
        .method(
            MethodSpec::new("watch")
                .returns_class("ChangeStreamCursor")
                .topologies(&[Topology::ReplSet, Topology::Sharded, Topology::LoadBalanced])
                .server_versions(VersionRange::since("4.0.0")),
        )
}

fn value_class(name: &str) -> ClassSpec {
    ClassSpec::new(name).with_help(true)
}

/// Every built-in class, parents before children.
pub fn builtin_classes() -> Vec<ClassSpec> {
    vec![
        abstract_cursor(),
        find_cursor(),
        aggregation_cursor(),
        run_command_cursor(),
        change_stream_cursor(),
        collection(),
        database(),
        value_class("CursorIterationResult"),
        value_class("ExplainOutput"),
        value_class("CommandResult"),
        value_class("DeleteResult"),
        value_class("InsertOneResult"),
        value_class("InsertManyResult"),
        value_class("UpdateResult"),
        value_class("BulkWriteResult"),
    ]
}
